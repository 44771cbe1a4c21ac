//! Supervisor exit on `TERM`. Kept in its own test binary: raised signals are
//! process-wide and would leak into unrelated tests.

use std::time::Duration;

use nix::sys::signal::{raise, Signal};

use procsup::config::Config;
use procsup::supervisor::Supervisor;

#[tokio::test]
async fn term_stops_children_and_exits() {
    let config =
        Config::from_yaml("run: {a: {cmd: \"sleep 30\", start_wait: 0.05}}").unwrap();
    let sup = tokio::spawn(Supervisor::new(config).run());

    // let the handler install and the child come up
    tokio::time::sleep(Duration::from_millis(300)).await;
    raise(Signal::SIGTERM).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), sup)
        .await
        .expect("supervisor did not exit on TERM")
        .expect("supervisor task panicked");
    assert!(result.is_ok());
}
