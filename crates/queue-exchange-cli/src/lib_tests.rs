//! Tests for the queue-exchange-cli library module.

use super::*;

const KNOWN_TOKEN: &str = "SharedAccessSignature sr=contoso.servicebus.windows.net%2Forders\
     &sig=u%2FPGi6dpVGp6daIZ6zjNL%2BSmVuXFvpFNBGhqtnX0QH4%3D\
     &se=1700604800&skn=RootManageSharedAccessKey";

const ISSUED_AT: i64 = 1_700_000_000;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(args).unwrap()
}

fn run_to_string(args: &[&str]) -> (Result<(), CliError>, String) {
    let mut out = Vec::new();
    let result = run(parse(args), &mut out);
    (result, String::from_utf8(out).unwrap())
}

fn key() -> SharedKey {
    SharedKey::from_string("my-key".to_string())
}

fn at(seconds: i64) -> Timestamp {
    Timestamp::from_epoch_seconds(seconds).unwrap()
}

// ============================================================================
// Parsing
// ============================================================================

mod parsing {
    use super::*;

    #[test]
    fn test_token_command_parsing() {
        let cli = parse(&[
            "queue-exchange",
            "token",
            "--entity",
            "orders",
            "--namespace",
            "contoso",
            "--key",
            "my-key",
            "--validity-secs",
            "60",
            "--format",
            "json",
        ]);

        match cli.command {
            Commands::Token {
                scope,
                signing,
                format,
            } => {
                assert_eq!(scope.entity, "orders");
                assert_eq!(scope.namespace.as_deref(), Some("contoso"));
                assert_eq!(signing.key.as_deref(), Some("my-key"));
                assert_eq!(signing.validity_secs, Some(60));
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("Expected Token command, got {:?}", other),
        }
    }

    #[test]
    fn test_simulate_defaults() {
        let cli = parse(&["queue-exchange", "simulate"]);

        assert_eq!(cli.log_level, "warn");
        match cli.command {
            Commands::Simulate {
                queue,
                messages,
                fail_at,
                forward_to,
                ..
            } => {
                assert_eq!(queue, "orders");
                assert_eq!(messages, vec!["a", "b", "c"]);
                assert_eq!(fail_at, None);
                assert_eq!(forward_to, None);
            }
            other => panic!("Expected Simulate command, got {:?}", other),
        }
    }

    #[test]
    fn test_simulate_messages_are_comma_separated() {
        let cli = parse(&["queue-exchange", "simulate", "-m", "x,y", "--fail-at", "2"]);

        match cli.command {
            Commands::Simulate {
                messages, fail_at, ..
            } => {
                assert_eq!(messages, vec!["x", "y"]);
                assert_eq!(fail_at, Some(2));
            }
            other => panic!("Expected Simulate command, got {:?}", other),
        }
    }

    #[test]
    fn test_token_requires_entity() {
        let result = Cli::try_parse_from(["queue-exchange", "token", "--key", "k"]);
        assert!(result.is_err());
    }
}

// ============================================================================
// Token Commands
// ============================================================================

mod token_commands {
    use super::*;

    #[test]
    fn test_token_matches_known_vector() {
        let (result, output) = run_to_string(&[
            "queue-exchange",
            "token",
            "--entity",
            "orders",
            "--namespace",
            "contoso",
            "--key",
            "my-key",
            "--issued-at",
            "1700000000",
        ]);

        result.unwrap();
        assert_eq!(output.trim_end(), KNOWN_TOKEN);
    }

    #[test]
    fn test_token_json_reports_expiry() {
        let (result, output) = run_to_string(&[
            "queue-exchange",
            "token",
            "-e",
            "orders",
            "-n",
            "contoso",
            "--key",
            "my-key",
            "--issued-at",
            "1700000000",
            "--format",
            "json",
        ]);
        result.unwrap();

        let json: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(json["expiry"], 1_700_604_800);
        assert_eq!(json["expires_at"], "2023-11-21T22:13:20Z");
        assert_eq!(json["resource_uri"], "contoso.servicebus.windows.net/orders");
        assert_eq!(json["token"], KNOWN_TOKEN);
    }

    #[test]
    fn test_connection_string_wraps_token() {
        let (result, output) = run_to_string(&[
            "queue-exchange",
            "connection-string",
            "-e",
            "orders",
            "-n",
            "contoso",
            "--key",
            "my-key",
            "--issued-at",
            "1700000000",
        ]);

        result.unwrap();
        assert_eq!(
            output.trim_end(),
            format!(
                "Endpoint=contoso.servicebus.windows.net;SharedAccessSignature={}",
                KNOWN_TOKEN
            )
        );
    }

    #[test]
    fn test_missing_namespace_is_a_configuration_error() {
        let (result, _) = run_to_string(&[
            "queue-exchange",
            "token",
            "-e",
            "orders",
            "--key",
            "my-key",
        ]);

        let error = result.unwrap_err();
        assert!(matches!(error, CliError::Configuration(_)));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_empty_key_is_an_invalid_argument() {
        let (result, _) = run_to_string(&[
            "queue-exchange",
            "token",
            "-e",
            "orders",
            "-n",
            "contoso",
            "--key",
            "",
        ]);

        let error = result.unwrap_err();
        assert!(matches!(error, CliError::InvalidArgument { .. }));
        assert_eq!(error.exit_code(), 4);
    }

    #[test]
    fn test_zero_validity_is_rejected() {
        let (result, _) = run_to_string(&[
            "queue-exchange",
            "token",
            "-e",
            "orders",
            "-n",
            "contoso",
            "--key",
            "my-key",
            "--validity-secs",
            "0",
        ]);

        assert!(matches!(result, Err(CliError::Configuration(_))));
    }
}

// ============================================================================
// Inspection
// ============================================================================

mod inspection {
    use super::*;

    #[test]
    fn test_inspect_without_key_skips_signature() {
        let report = inspect(KNOWN_TOKEN, None, at(ISSUED_AT)).unwrap();

        assert_eq!(report.endpoint, None);
        assert_eq!(report.resource_uri, "contoso.servicebus.windows.net/orders");
        assert_eq!(report.key_name, "RootManageSharedAccessKey");
        assert_eq!(report.expiry, 1_700_604_800);
        assert!(!report.expired);
        assert_eq!(report.signature, SignatureCheck::NotChecked);
    }

    #[test]
    fn test_inspect_verifies_with_key() {
        let valid = inspect(KNOWN_TOKEN, Some(&key()), at(ISSUED_AT)).unwrap();
        let wrong = SharedKey::from_string("other-key".to_string());
        let invalid = inspect(KNOWN_TOKEN, Some(&wrong), at(ISSUED_AT)).unwrap();

        assert_eq!(valid.signature, SignatureCheck::Valid);
        assert_eq!(invalid.signature, SignatureCheck::Invalid);
    }

    #[test]
    fn test_inspect_reports_expiry() {
        let report = inspect(KNOWN_TOKEN, Some(&key()), at(1_700_604_801)).unwrap();

        assert!(report.expired);
        assert_eq!(report.signature, SignatureCheck::Valid);
    }

    #[test]
    fn test_inspect_connection_string() {
        let value = format!(
            "Endpoint=sb://contoso.servicebus.windows.net/;SharedAccessSignature={}",
            KNOWN_TOKEN
        );

        let report = inspect(&value, None, at(ISSUED_AT)).unwrap();

        assert_eq!(
            report.endpoint.as_deref(),
            Some("contoso.servicebus.windows.net")
        );
        assert_eq!(report.resource_uri, "contoso.servicebus.windows.net/orders");
    }

    #[test]
    fn test_inspect_rejects_garbage() {
        assert!(inspect("not a token", None, at(ISSUED_AT)).is_err());
        assert!(inspect("Endpoint=contoso", None, at(ISSUED_AT)).is_err());
    }

    #[test]
    fn test_wrong_key_fails_the_command() {
        let (result, output) = run_to_string(&[
            "queue-exchange",
            "inspect",
            KNOWN_TOKEN,
            "--key",
            "other-key",
            "--at",
            "1700000000",
        ]);

        assert!(output.contains("signature:  invalid"));
        assert_eq!(result.unwrap_err().exit_code(), 3);
    }

    #[test]
    fn test_expired_token_fails_verification() {
        let (result, output) = run_to_string(&[
            "queue-exchange",
            "inspect",
            KNOWN_TOKEN,
            "--key",
            "my-key",
            "--at",
            "1800000000",
        ]);

        assert!(output.contains("expired:    yes"));
        assert!(matches!(result, Err(CliError::CommandFailed { .. })));
    }
}

// ============================================================================
// Simulation
// ============================================================================

mod simulation {
    use super::*;

    fn messages(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_send_then_receive_drains_queue() {
        let report = simulate(
            ExchangeConfig::default(),
            "orders",
            &messages(&["a", "b", "c"]),
            None,
            None,
        )
        .unwrap();

        assert_eq!(report.sent, 3);
        assert_eq!(report.send_error, None);
        assert_eq!(report.queued, 3);
        assert_eq!(report.received, vec!["a", "b", "c"]);
        assert_eq!(report.remaining, 0);
    }

    #[test]
    fn test_injected_failure_leaves_nothing_queued() {
        let report = simulate(
            ExchangeConfig::default(),
            "orders",
            &messages(&["a", "b", "c"]),
            Some(2),
            None,
        )
        .unwrap();

        assert_eq!(report.sent, 0);
        assert!(report.send_error.is_some());
        assert_eq!(report.queued, 0);
        assert!(report.received.is_empty());
    }

    #[test]
    fn test_forward_moves_messages() {
        let report = simulate(
            ExchangeConfig::default(),
            "orders",
            &messages(&["a", "b"]),
            None,
            Some("audit"),
        )
        .unwrap();

        assert_eq!(report.received, vec!["a", "b"]);
        assert_eq!(report.forwarded, 2);
        assert_eq!(report.remaining, 0);
    }

    #[test]
    fn test_invalid_queue_name_is_rejected() {
        let result = simulate(
            ExchangeConfig::default(),
            "bad@queue",
            &messages(&["a"]),
            None,
            None,
        );

        assert!(matches!(result, Err(CliError::Exchange(_))));
    }
}

// ============================================================================
// Configuration
// ============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_show_prints_defaults_then_validates() {
        let (result, output) =
            run_to_string(&["queue-exchange", "config", "--show", "--format", "toml"]);

        assert!(output.contains("broker_domain = \"servicebus.windows.net\""));
        assert!(output.contains("[receive]"));
        // No namespace configured
        assert!(matches!(result, Err(CliError::Configuration(_))));
    }

    #[test]
    fn test_config_file_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exchange.toml");
        std::fs::write(&path, "namespace = \"contoso\"\nmax_batch_size = 50\n").unwrap();

        let (result, output) = run_to_string(&[
            "queue-exchange",
            "--config",
            path.to_str().unwrap(),
            "config",
            "--show",
            "--format",
            "json",
        ]);

        result.unwrap();
        assert!(output.contains("\"namespace\": \"contoso\""));
        assert!(output.contains("\"max_batch_size\": 50"));
        assert!(output.trim_end().ends_with("configuration is valid"));
    }

    #[test]
    fn test_completions_need_no_configuration() {
        let (result, output) = run_to_string(&[
            "queue-exchange",
            "--config",
            "/nonexistent/exchange.toml",
            "completions",
            "bash",
        ]);

        result.unwrap();
        assert!(output.contains("queue-exchange"));
    }
}

#[test]
fn test_exit_codes_are_distinct() {
    let errors = [
        CliError::Configuration(ConfigurationError::Missing {
            key: "namespace".to_string(),
        }),
        CliError::Exchange(ExchangeError::Cancelled),
        CliError::CommandFailed {
            message: "x".to_string(),
        },
        CliError::InvalidArgument {
            arg: "--key".to_string(),
            message: "x".to_string(),
        },
        CliError::Io(std::io::Error::other("x")),
        CliError::Credential(CredentialError::SignatureMismatch),
    ];

    let mut codes: Vec<i32> = errors.iter().map(CliError::exit_code).collect();
    codes.dedup();
    assert_eq!(codes, vec![1, 2, 3, 4, 5, 6]);
}
