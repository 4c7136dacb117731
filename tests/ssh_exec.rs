//! SSH execution tests
//!
//! Type-level tests run with the `ssh` feature alone. The live tests need a
//! reachable host and run only with `--features ssh-tests`, taking the
//! target from `SHELL_EXECUTOR_SSH_HOST` (and optionally
//! `SHELL_EXECUTOR_SSH_USER`).

#[cfg(feature = "ssh")]
mod type_composition {
    use shell_executor::{Command, ConnectionId, ExecutionParams, SshEndpoint};

    #[test]
    fn test_endpoint_identity_drives_connection_id() {
        let a = ConnectionId::Ssh(SshEndpoint::new("host-a").with_user("deploy"));
        let b = ConnectionId::Ssh(SshEndpoint::new("host-a").with_user("deploy"));
        let c = ConnectionId::Ssh(SshEndpoint::new("host-a").with_user("other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_remote_execution_request_composes() {
        // Proves the remote path type-checks without a live host
        let id = ConnectionId::Ssh(
            SshEndpoint::new("remote.example.com")
                .with_user("tester")
                .with_port(2222),
        );
        let command = Command::new("uname").arg("-a");
        let params = ExecutionParams::builder().build().unwrap();
        let _ = (id, command, params);
    }
}

#[cfg(feature = "ssh-tests")]
mod live {
    use std::time::Duration;

    use shell_executor::{
        Command, ConnectionId, ConnectionManager, ExecutionParams, SshEndpoint,
    };

    fn endpoint() -> Option<SshEndpoint> {
        let host = std::env::var("SHELL_EXECUTOR_SSH_HOST").ok()?;
        let mut endpoint = SshEndpoint::new(host);
        if let Ok(user) = std::env::var("SHELL_EXECUTOR_SSH_USER") {
            endpoint = endpoint.with_user(user);
        }
        Some(endpoint)
    }

    #[test]
    fn test_remote_echo() {
        let Some(endpoint) = endpoint() else {
            eprintln!("SHELL_EXECUTOR_SSH_HOST not set, skipping");
            return;
        };
        futures::executor::block_on(async {
            let manager = ConnectionManager::new();
            let id = ConnectionId::Ssh(endpoint);
            let output = manager
                .execute(
                    Some(&id),
                    Command::new("echo").arg("over the wire"),
                    ExecutionParams::builder()
                        .timeout(Duration::from_secs(30))
                        .build()
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(output.stdout_line(), "over the wire");

            manager.close_all().await.unwrap();
        });
    }

    #[test]
    fn test_remote_env_and_cwd() {
        let Some(endpoint) = endpoint() else {
            eprintln!("SHELL_EXECUTOR_SSH_HOST not set, skipping");
            return;
        };
        futures::executor::block_on(async {
            let manager = ConnectionManager::new();
            let id = ConnectionId::Ssh(endpoint);
            let params = ExecutionParams::builder()
                .env("MARKER", "remote-42")
                .current_dir("/tmp")
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap();
            let output = manager
                .execute(
                    Some(&id),
                    Command::new("sh").arg("-c").arg("echo $MARKER; pwd"),
                    params,
                )
                .await
                .unwrap();
            let mut lines = output.stdout.lines();
            assert_eq!(lines.next(), Some("remote-42"));
            assert_eq!(lines.next(), Some("/tmp"));

            manager.close_all().await.unwrap();
        });
    }

    #[test]
    fn test_remote_temp_dir_lifecycle() {
        let Some(endpoint) = endpoint() else {
            eprintln!("SHELL_EXECUTOR_SSH_HOST not set, skipping");
            return;
        };
        futures::executor::block_on(async {
            let manager = ConnectionManager::new();
            let id = ConnectionId::Ssh(endpoint);
            let connection = manager.get(&id).await.unwrap();

            let dir = connection.create_temp_dir(true).await.unwrap();
            assert!(dir.to_string_lossy().starts_with("/tmp"));

            let hostname = connection.hostname().await.unwrap();
            assert!(!hostname.is_empty());

            manager.close_all().await.unwrap();
        });
    }
}
