//! Byte-level SMTP exchanges against a running server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};

use common::{connect, read_line, spawn_smtp, HOSTNAME};
use ironpost::backend::MemoryBackend;

fn backend() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new().with_user("bob@example.com", "secret"))
}

#[tokio::test]
async fn message_submission_lands_in_the_backend() {
    let backend = backend();
    let server = spawn_smtp(backend.clone()).await;
    let stream = connect(server.plain).await;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let greeting = read_line(&mut reader).await;
    assert!(greeting.starts_with(&format!("220 {HOSTNAME}")), "{greeting}");

    write_half.write_all(b"EHLO client.test\r\n").await.unwrap();
    loop {
        let line = read_line(&mut reader).await;
        assert!(line.starts_with("250"), "{line}");
        if line.starts_with("250 ") {
            break;
        }
    }

    write_half
        .write_all(b"MAIL FROM:<alice@remote.test>\r\n")
        .await
        .unwrap();
    assert!(read_line(&mut reader).await.starts_with("250"));

    write_half
        .write_all(b"RCPT TO:<bob@example.com>\r\n")
        .await
        .unwrap();
    assert!(read_line(&mut reader).await.starts_with("250"));

    write_half.write_all(b"DATA\r\n").await.unwrap();
    assert!(read_line(&mut reader).await.starts_with("354"));

    // Dot-stuffed line in the body.
    write_half
        .write_all(b"Subject: hi\r\n\r\nfirst line\r\n..leading dot\r\n.\r\n")
        .await
        .unwrap();
    assert!(read_line(&mut reader).await.starts_with("250"));

    write_half.write_all(b"QUIT\r\n").await.unwrap();
    assert!(read_line(&mut reader).await.starts_with("221"));

    let delivered = backend.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].sender, "alice@remote.test");
    assert_eq!(delivered[0].recipients, vec!["bob@example.com"]);
    // Transmission stuffing undone before storage.
    assert_eq!(
        delivered[0].body,
        b"Subject: hi\r\n\r\nfirst line\r\n.leading dot"
    );

    server.handle.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn empty_data_body_is_accepted_immediately() {
    let backend = backend();
    let server = spawn_smtp(backend.clone()).await;
    let stream = connect(server.plain).await;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    read_line(&mut reader).await;

    write_half.write_all(b"HELO client.test\r\n").await.unwrap();
    read_line(&mut reader).await;
    write_half.write_all(b"MAIL FROM:<a@b>\r\n").await.unwrap();
    read_line(&mut reader).await;
    write_half
        .write_all(b"RCPT TO:<bob@example.com>\r\n")
        .await
        .unwrap();
    read_line(&mut reader).await;
    write_half.write_all(b"DATA\r\n").await.unwrap();
    assert!(read_line(&mut reader).await.starts_with("354"));

    // Nothing but the terminator line.
    write_half.write_all(b".\r\n").await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), read_line(&mut reader))
        .await
        .expect("empty DATA body should complete without waiting for the idle timeout");
    assert!(reply.starts_with("250"), "{reply}");

    let delivered = backend.delivered();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].body.is_empty());

    server.handle.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn out_of_order_commands_get_rejected_on_the_wire() {
    let server = spawn_smtp(backend()).await;
    let stream = connect(server.plain).await;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    read_line(&mut reader).await;

    write_half.write_all(b"DATA\r\n").await.unwrap();
    assert!(read_line(&mut reader).await.starts_with("503"));

    write_half.write_all(b"MAIL FROM:<a@b>\r\n").await.unwrap();
    assert!(read_line(&mut reader).await.starts_with("503"));

    // A proper greeting recovers the session.
    write_half.write_all(b"HELO client.test\r\n").await.unwrap();
    assert!(read_line(&mut reader).await.starts_with("250"));

    server.handle.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn unknown_recipient_is_refused_with_550() {
    let server = spawn_smtp(backend()).await;
    let stream = connect(server.plain).await;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    read_line(&mut reader).await;

    write_half.write_all(b"HELO client.test\r\n").await.unwrap();
    read_line(&mut reader).await;
    write_half.write_all(b"MAIL FROM:<a@b>\r\n").await.unwrap();
    read_line(&mut reader).await;

    write_half
        .write_all(b"RCPT TO:<nobody@example.com>\r\n")
        .await
        .unwrap();
    assert!(read_line(&mut reader).await.starts_with("550"));

    server.handle.shutdown(Duration::from_secs(5)).await;
}
