use logcraft::masking::{mask, signature, TokenKind};

#[test]
fn masks_common_variable_tokens() {
    let m = mask("User 123 logged in from 192.168.1.1 at 2024-01-01T12:00:00Z");
    assert_eq!(m.pattern, "User <*> logged in from <*> at <*>");
    let kinds: Vec<TokenKind> = m.variables.iter().map(|(k, _)| *k).collect();
    assert_eq!(kinds, vec![TokenKind::Number, TokenKind::Ip, TokenKind::Timestamp]);
}

#[test]
fn masks_uuid_hex_and_quoted_strings() {
    let m = mask(r#"job 550e8400-e29b-41d4-a716-446655440000 wrote 0xdeadbeef to "/tmp/a b""#);
    assert_eq!(m.pattern, "job <*> wrote <*> to <*>");
}

#[test]
fn hex_shaped_words_stay_literal() {
    assert_eq!(mask("deadline exceeded in facade").pattern, "deadline exceeded in facade");
    assert_eq!(mask("commit a1b2c3d4e5 pushed").pattern, "commit <*> pushed");
}

#[test]
fn unit_suffix_stays_literal() {
    assert_eq!(mask("request took 15ms").pattern, "request took <*>ms");
    assert_eq!(mask("request took 230ms").pattern, mask("request took 15ms").pattern);
}

#[test]
fn ipv6_and_ip_with_port() {
    assert_eq!(mask("peer 2001:0db8:85a3:0000:0000:8a2e:0370:7334 gone").pattern, "peer <*> gone");
    assert_eq!(mask("dial 10.1.2.3:8080 refused").pattern, "dial <*> refused");
}

#[test]
fn identifiers_with_digits_are_not_split() {
    assert_eq!(mask("worker node7 ready").pattern, "worker node7 ready");
}

#[test]
fn signature_uses_first_line_and_normalizes_whitespace() {
    let trace = "java.lang.IllegalStateException: boom 42\n\tat com.example.Foo.bar(Foo.java:10)";
    assert_eq!(signature(trace), "java.lang.IllegalStateException: boom <*>");
    assert_eq!(signature("  db   timeout   id=7  "), "db timeout id=<*>");
}

#[test]
fn lines_differing_only_in_variables_share_a_signature() {
    let a = signature("db timeout id=123 after 30s from 10.0.0.1");
    let b = signature("db timeout id=98765 after 5s from 172.16.4.2");
    assert_eq!(a, b);
    assert_ne!(a, signature("db connected id=123 after 30s from 10.0.0.1"));
}

#[test]
fn only_ascii_digits_are_masked() {
    assert_eq!(mask("took \u{0663}\u{0660}ms then 30ms").pattern, "took \u{0663}\u{0660}ms then <*>ms");
}
