//! Deadlock-freedom tests for the communication loop
//!
//! These push well past any OS pipe buffer in both directions at once; a
//! sequential write-then-read implementation would deadlock here.

use std::time::Duration;

use shell_executor::{Command, ConnectionManager, ExecutionParams};

const PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

fn payload() -> Vec<u8> {
    let mut data = Vec::with_capacity(PAYLOAD_SIZE);
    let line = b"0123456789abcdef0123456789abcdef0123456789abcde\n";
    while data.len() < PAYLOAD_SIZE {
        data.extend_from_slice(line);
    }
    data.truncate(PAYLOAD_SIZE);
    data
}

#[test]
fn test_large_payload_round_trip_through_cat() {
    futures::executor::block_on(async {
        let manager = ConnectionManager::new();
        let data = payload();
        let params = ExecutionParams::builder()
            .stdin_data(data.clone())
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap();

        let output = manager
            .execute(None, Command::new("cat"), params)
            .await
            .unwrap();

        assert_eq!(output.stdout.len(), data.len());
        assert_eq!(output.stdout.as_bytes(), &data[..]);
    });
}

#[test]
fn test_incremental_sends_interleave_with_reads() {
    futures::executor::block_on(async {
        let manager = ConnectionManager::new();
        let params = ExecutionParams::builder()
            .stdin(true)
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap();
        let mut process = manager
            .process(None, Command::new("cat"), params)
            .await
            .unwrap();

        // Each chunk alone exceeds a typical 64 KiB pipe buffer
        let chunk = vec![b'x'; 256 * 1024];
        for _ in 0..8 {
            process.send_all(&chunk).await.unwrap();
        }

        let status = process.wait(None).await.unwrap();
        assert!(status.success());
        assert_eq!(process.stdout().len(), chunk.len() * 8);
    });
}

#[test]
fn test_stdout_and_stderr_drain_concurrently() {
    futures::executor::block_on(async {
        let manager = ConnectionManager::new();
        // Both streams emit more than a pipe buffer's worth
        let script = "i=0; while [ $i -lt 20000 ]; do \
                      echo 'out line with some padding to fill the pipe'; \
                      echo 'err line with some padding to fill the pipe' >&2; \
                      i=$((i+1)); done";
        let params = ExecutionParams::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap();

        let output = manager
            .execute(None, Command::new("sh").arg("-c").arg(script), params)
            .await
            .unwrap();

        assert_eq!(
            output.stdout.lines().count(),
            20000,
            "stdout lines lost or truncated"
        );
        assert_eq!(
            output.stderr.lines().count(),
            20000,
            "stderr lines lost or truncated"
        );
    });
}
