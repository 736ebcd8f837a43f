//! End-to-end digest-auth construction (scenario S5): a challenged
//! REGISTER's retry carries `Authorization: Digest ... response=...`
//! matching RFC 2617's `md5(md5(u:realm:p):nonce:md5(method:uri))`.

use my_agent::sip::SipDialogState;

#[test]
fn digest_response_matches_worked_example() {
    // Values from spec.md's S5 scenario.
    let username = "trunk-user";
    let realm = "voiceprovider.example";
    let password = "hunter2";
    let nonce = "7f3c9a";
    let method = "REGISTER";
    let uri = "sip:voiceprovider.example";

    let ha1 = format!("{:x}", md5::compute(format!("{username}:{realm}:{password}")));
    let ha2 = format!("{:x}", md5::compute(format!("{method}:{uri}")));
    let expected = format!("{:x}", md5::compute(format!("{ha1}:{nonce}:{ha2}")));

    let header = my_agent::sip::digest::build_authorization_header(username, realm, password, nonce, method, uri);
    assert!(header.contains(&format!("response=\"{expected}\"")));
    assert!(header.starts_with("Digest "));
}

#[test]
fn challenge_header_round_trips_realm_and_nonce() {
    let challenge = my_agent::sip::digest::parse_challenge(r#"Digest realm="voiceprovider.example", nonce="7f3c9a", algorithm=MD5"#).unwrap();
    assert_eq!(challenge.realm, "voiceprovider.example");
    assert_eq!(challenge.nonce, "7f3c9a");
}

#[test]
fn dialog_cseq_increments_across_retries() {
    let mut dialog = SipDialogState::new(30000);
    let first = dialog.next_cseq();
    let second = dialog.next_cseq();
    assert_eq!(second, first + 1);
}
