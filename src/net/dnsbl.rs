use std::net::IpAddr;

use tracing::debug;

/// DNS blocklist check: the peer's IPv4 octets are reversed and appended to
/// the blocklist zone; any A record on the resulting name means the address
/// is listed. IPv6 peers and resolution failures are treated as not listed.
pub async fn is_listed(addr: IpAddr, zone: &str) -> bool {
    let IpAddr::V4(v4) = addr else {
        return false;
    };

    let query = reverse_query(v4.octets(), zone);
    match tokio::net::lookup_host((query, 0)).await {
        Ok(mut answers) => {
            let listed = answers.next().is_some();
            if listed {
                debug!("{addr} is listed on {zone}");
            }
            listed
        }
        Err(_) => false,
    }
}

fn reverse_query(octets: [u8; 4], zone: &str) -> String {
    format!(
        "{}.{}.{}.{}.{}",
        octets[3], octets[2], octets[1], octets[0], zone
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_reverses_the_octets() {
        assert_eq!(
            reverse_query([192, 0, 2, 99], "zen.spamhaus.org"),
            "99.2.0.192.zen.spamhaus.org"
        );
    }

    #[tokio::test]
    async fn ipv6_peers_are_never_listed() {
        let addr: IpAddr = "::1".parse().unwrap();
        assert!(!is_listed(addr, "zen.spamhaus.org").await);
    }

    #[tokio::test]
    async fn resolution_failure_means_not_listed() {
        // `.invalid` is reserved and never resolves.
        let addr: IpAddr = "192.0.2.99".parse().unwrap();
        assert!(!is_listed(addr, "dnsbl.invalid").await);
    }
}
