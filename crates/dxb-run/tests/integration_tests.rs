use assert_cmd::cargo;
use rstest::rstest;
use scopeguard::defer;
use std::io::Write;

#[test]
fn test_cli_run_with_stdin() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = cargo::cargo_bin_cmd!("dxb");

    let assert = cmd.arg("--body-only").write_stdin("1 + 2").assert();
    assert.success().code(0).stdout("c10192c10201\n");

    Ok(())
}

#[rstest]
#[case::hex(vec!["--body-only", "'ab'"], "ce02616201\n")]
#[case::no_header_alias(vec!["--no-header", "null"], "c801\n")]
#[case::base64(vec!["--body-only", "-F", "base64", "5"], "wQUB\n")]
#[case::value(vec!["--body-only", "--value", "[1, true]"], "e0eac101eac6e101\n")]
#[case::placeholders(vec!["--body-only", "--arg", "3", "? + ?", "--arg", "4"], "c10392c10401\n")]
fn test_cli_output(#[case] args: Vec<&str>, #[case] expected: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = cargo::cargo_bin_cmd!("dxb");
    cmd.args(args).assert().success().stdout(expected.to_string());
    Ok(())
}

#[test]
fn test_cli_raw_output() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = cargo::cargo_bin_cmd!("dxb");
    cmd.args(["--body-only", "-F", "raw", "true"])
        .assert()
        .success()
        .stdout(vec![0xc6, 0x01]);
    Ok(())
}

#[test]
fn test_cli_json_output() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = cargo::cargo_bin_cmd!("dxb");
    let output = cmd.args(["-F", "json", "--to", "@bob", "1"]).output()?;
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let block = &json[0]["blocks"][0];
    assert_eq!(block["layout"]["size"], block["size"]);
    assert!(json[0]["file"].is_null());
    Ok(())
}

#[test]
fn test_cli_split_blocks() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = cargo::cargo_bin_cmd!("dxb");
    let output = cmd
        .args(["--body-only", "--max-block-size", "4", "[1, 2, 3, 4]"])
        .output()?;
    assert!(output.status.success());

    let lines = String::from_utf8(output.stdout)?;
    let lines = lines.lines().collect::<Vec<_>>();
    assert!(lines.len() > 1);
    assert_eq!(lines.concat(), "e0eac101eac102eac103eac104e101");
    Ok(())
}

#[test]
fn test_cli_files() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let first = dir.path().join("first.dx");
    let second = dir.path().join("second.dx");
    std::fs::File::create(&first)?.write_all(b"var x = 1; x")?;
    std::fs::File::create(&second)?.write_all(b"'two'")?;

    let mut cmd = cargo::cargo_bin_cmd!("dxb");
    let assert = cmd
        .arg("--body-only")
        .arg("-f")
        .arg(&first)
        .arg(&second)
        .assert();
    assert.success().stdout("a8000001c10101a400000101\nce0374776f01\n");
    Ok(())
}

#[test]
fn test_cli_output_file() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::temp_dir().join("dxb_cli_output_file.hex");
    let cleanup = path.clone();
    defer! {
        let _ = std::fs::remove_file(&cleanup);
    }

    let mut cmd = cargo::cargo_bin_cmd!("dxb");
    cmd.args(["--body-only", "-o"]).arg(&path).arg("42").assert().success().stdout("");
    assert_eq!(std::fs::read_to_string(&path)?, "c12a01\n");
    Ok(())
}

#[rstest]
#[case::syntax_error(vec!["(1"], "Missing closing bracket")]
#[case::undeclared(vec!["y"], "Variable 'y' was not declared in scope")]
#[case::invalid_endpoint(vec!["--to", "bob", "1"], "Invalid endpoint")]
#[case::missing_file(vec!["-f", "/nonexistent/dxb_missing.dx"], "File not found")]
#[case::invalid_value(vec!["--value", "{"], "Invalid JSON value")]
#[case::unknown_type(vec!["--type", "bogus", "1"], "Unknown message type")]
#[case::no_crypto_flags(vec!["--sign", "1"], "unexpected argument '--sign'")]
fn test_cli_errors(#[case] args: Vec<&str>, #[case] expected: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = cargo::cargo_bin_cmd!("dxb");
    let output = cmd.args(args).output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(expected), "unexpected stderr: {stderr}");
    Ok(())
}
