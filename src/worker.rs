use std::thread::{self, JoinHandle};

/// Runs `work` on its own named thread and hands the result to `done` on
/// that same thread once it finishes.
pub fn spawn<T, W, D>(name: &str, work: W, done: D) -> std::io::Result<JoinHandle<()>>
where
    W: FnOnce() -> T + Send + 'static,
    D: FnOnce(T) + Send + 'static,
    T: 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || done(work()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn done_receives_the_result() {
        let (tx, rx) = mpsc::channel();
        let handle = spawn(
            "dvr-test",
            || thread::current().name().map(String::from),
            move |name| {
                let _ = tx.send(name);
            },
        )
        .expect("spawn");
        let name = rx.recv_timeout(Duration::from_secs(5)).expect("result");
        assert_eq!(name.as_deref(), Some("dvr-test"));
        handle.join().expect("join");
    }
}
