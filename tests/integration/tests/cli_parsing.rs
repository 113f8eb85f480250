//! CLI argument routing through the library entry points.

use clap::Parser;
use saferun_cli::commands::run::{parse_input, EngineKind};
use saferun_cli::{Cli, Commands};

#[test]
fn test_every_admin_command_parses() {
    let cases: &[&[&str]] = &[
        &["saferun", "list", "containers"],
        &["saferun", "list", "images"],
        &["saferun", "container", "saferun-0123abcd"],
        &["saferun", "stop", "container", "abc"],
        &["saferun", "stop", "all", "--timeout-seconds", "1"],
        &["saferun", "kill", "container", "abc"],
        &["saferun", "cleanup"],
        &["saferun", "version"],
    ];
    for argv in cases {
        assert!(Cli::try_parse_from(*argv).is_ok(), "failed to parse {:?}", argv);
    }
}

#[test]
fn test_unknown_command_rejected() {
    assert!(Cli::try_parse_from(["saferun", "destroy"]).is_err());
    assert!(Cli::try_parse_from(["saferun", "kill"]).is_err());
}

#[test]
fn test_run_defaults_to_local_engine() {
    let cli = Cli::try_parse_from(["saferun", "run", "-"]).unwrap();
    match cli.command {
        Commands::Run(args) => {
            assert_eq!(args.file, "-");
            assert_eq!(args.engine, EngineKind::Local);
            assert!(args.packages.is_empty());
        }
        _ => panic!("Expected Run command"),
    }
}

#[test]
fn test_run_rejects_bad_creator() {
    assert!(Cli::try_parse_from(["saferun", "run", "x.py", "--creator", "conda"]).is_err());
}

#[test]
fn test_input_must_be_object() {
    assert!(parse_input(r#"{"a": 1}"#).is_ok());
    assert!(parse_input("42").is_err());
}
