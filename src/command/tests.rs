//! Unit tests for remote command construction.

use super::*;
use rstest::rstest;

const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGx1 alice@laptop";

#[rstest]
#[case::semicolon("ssh-ed25519 AAAA; rm -rf /", ';')]
#[case::pipe("ssh-ed25519 AAAA | sh", '|')]
#[case::ampersand("ssh-ed25519 AAAA && reboot", '&')]
#[case::dollar("ssh-ed25519 $HOME", '$')]
#[case::backtick("ssh-ed25519 `id`", '`')]
#[case::newline("ssh-ed25519 AAAA\nreboot", '\n')]
#[case::single_quote("ssh-ed25519 'AAAA'", '\'')]
fn untrusted_content_with_metacharacters_is_rejected(#[case] content: &str, #[case] found: char) {
    let err = key_membership(Utf8Path::new(AUTHORIZED_KEYS_FILE), content)
        .expect_err("metacharacters must be rejected");
    assert_eq!(err, CommandError::InvalidCharacters { found });
    assert!(err.to_string().contains("invalid characters"), "{err}");
}

#[rstest]
#[case::empty("")]
#[case::spaces("   ")]
#[case::tab("\t")]
fn blank_content_is_rejected(#[case] content: &str) {
    let err = append_line(Utf8Path::new(AUTHORIZED_KEYS_FILE), content)
        .expect_err("blank content must be rejected");
    assert_eq!(err, CommandError::EmptyInput);
}

#[rstest]
#[case::long_option("--file=/etc/shadow")]
#[case::short_option("-e x")]
#[case::padded("  -f /etc/passwd")]
fn option_shaped_content_is_rejected(#[case] content: &str) {
    let file = Utf8Path::new(AUTHORIZED_KEYS_FILE);
    assert_eq!(
        key_membership(file, content).expect_err("membership must reject"),
        CommandError::LeadingDash
    );
    assert_eq!(
        append_line(file, content).expect_err("append must reject"),
        CommandError::LeadingDash
    );
}

#[test]
fn grep_patterns_are_passed_after_an_explicit_flag() {
    let file = Utf8Path::new(AUTHORIZED_KEYS_FILE);
    let membership = key_membership(file, KEY).expect("valid key should build");
    assert!(
        membership.script().contains(&format!("grep -cxF -e '{KEY}'")),
        "{membership}"
    );
    let append = append_line(file, KEY).expect("valid key should build");
    assert!(
        append.script().contains(&format!("grep -qxF -e '{KEY}'")),
        "{append}"
    );
}

#[test]
fn membership_script_tolerates_missing_file() {
    let command = key_membership(Utf8Path::new(AUTHORIZED_KEYS_FILE), KEY)
        .expect("valid key should build");
    let script = command.script();
    assert!(script.contains("|| true"), "{script}");
    assert!(script.contains(&format!("'{KEY}'")), "{script}");
    assert_eq!(command.argv().len(), 1);
}

#[test]
fn append_script_creates_parent_directory_first() {
    let command =
        append_line(Utf8Path::new(AUTHORIZED_KEYS_FILE), KEY).expect("valid key should build");
    let script = command.script();
    assert!(script.starts_with("mkdir -p "), "{script}");
    assert!(script.contains("&&"), "{script}");
    assert!(script.contains("\"$HOME\"/.ssh"), "{script}");
    assert_eq!(command.argv(), [script]);
}

#[test]
fn append_script_is_idempotent_guarded() {
    let command =
        append_line(Utf8Path::new(AUTHORIZED_KEYS_FILE), KEY).expect("valid key should build");
    assert!(command.script().contains("grep -qxF"));
    assert!(command.script().contains(">>"));
}

#[rstest]
#[case("1\n", true)]
#[case("3", true)]
#[case("0\n", false)]
#[case("", false)]
#[case("garbage", false)]
fn membership_output_is_interpreted(#[case] stdout: &str, #[case] expected: bool) {
    assert_eq!(membership_present(stdout), expected);
}

#[test]
fn read_if_present_never_fails_remotely() {
    let command = read_if_present(Utf8Path::new("/var/lib/berth/keepalive"));
    assert_eq!(
        command.script(),
        "cat /var/lib/berth/keepalive 2>/dev/null || true"
    );
}
