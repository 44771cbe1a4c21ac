//! End-to-end control protocol exchange over a unix socket.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use procsup::config::Config;
use procsup::supervisor::Supervisor;

async fn wait_for_socket(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("control socket {} never appeared", path.display());
}

#[tokio::test]
async fn status_down_and_quit_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("ctl.sock");
    let yaml = format!(
        concat!(
            "run:\n",
            "  a: {{cmd: \"sleep 30\", start_wait: 0.05}}\n",
            "  b: {{cmd: \"false\", start_retries: 0, start_wait: 0.05}}\n",
            "global:\n",
            "  listen: \"unix/:{}\"\n",
        ),
        sock.display()
    );
    let config = Config::from_yaml(&yaml).unwrap();
    let sup = tokio::spawn(Supervisor::new(config).run());

    wait_for_socket(&sock).await;
    // let `a` pass start_wait and `b` reach fatal
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stream = UnixStream::connect(&sock).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    write.write_all(b"status\n").await.unwrap();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line, "\n");

    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("a up "), "unexpected status line: {line:?}");
    let fields: Vec<&str> = line.trim_end().split(' ').collect();
    assert_eq!(fields.len(), 4);
    fields[2].parse::<u32>().expect("pid field");
    let uptime = fields[3].parse::<u64>().expect("uptime field");
    assert!(uptime < 30);

    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line, "b fatal\n");

    write.write_all(b"down a\n").await.unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line, "\n");
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line, "down a 1\n");

    write.write_all(b".\n").await.unwrap();
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    sup.abort();
}

#[tokio::test]
async fn unknown_requests_keep_the_connection_open() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("ctl.sock");
    let yaml = format!(
        "run: {{a: \"sleep 30\"}}\nglobal: {{listen: \"unix/:{}\"}}",
        sock.display()
    );
    let config = Config::from_yaml(&yaml).unwrap();
    let sup = tokio::spawn(Supervisor::new(config).run());

    wait_for_socket(&sock).await;

    let stream = UnixStream::connect(&sock).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    write.write_all(b"bounce a\n").await.unwrap();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line, "\n");
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line, "bounce a unknown\n");

    write.write_all(b"up zzz\n").await.unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line, "\n");
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line, "up zzz unknown\n");

    // the connection survived both bad requests
    write.write_all(b"status a\n").await.unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line, "\n");
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("status a "));

    sup.abort();
}

#[tokio::test]
async fn oversize_request_disconnects() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("ctl.sock");
    let yaml = format!(
        "run: {{a: \"sleep 30\"}}\nglobal: {{listen: \"unix/:{}\"}}",
        sock.display()
    );
    let config = Config::from_yaml(&yaml).unwrap();
    let sup = tokio::spawn(Supervisor::new(config).run());

    wait_for_socket(&sock).await;

    let mut stream = UnixStream::connect(&sock).await.unwrap();
    stream.write_all(&[b'x'; 100]).await.unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);

    sup.abort();
}
