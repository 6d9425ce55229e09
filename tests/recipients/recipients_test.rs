//! Recipient file loading.

use campaigner::recipients::{
    load_recipients, parse_csv, parse_json_array, parse_json_lines, RecipientError,
};

#[test]
fn json_array_keeps_attributes() {
    let recipients = parse_json_array(
        r#"[
            {"email": " ada@example.com ", "name": "Ada", "plan": "pro", "seats": 3},
            {"email": "bob@example.com", "name": null}
        ]"#,
    )
    .expect("valid array");

    assert_eq!(recipients.len(), 2);
    assert_eq!(recipients[0].email, "ada@example.com");
    assert_eq!(recipients[0].name.as_deref(), Some("Ada"));
    assert_eq!(recipients[0].attributes.get("plan").map(String::as_str), Some("pro"));
    assert_eq!(recipients[0].attributes.get("seats").map(String::as_str), Some("3"));
    assert_eq!(recipients[1].name, None);
}

#[test]
fn entries_without_email_are_skipped() {
    let recipients =
        parse_json_array(r#"[{"name": "nobody"}, "just a string", {"email": "c@example.com"}]"#)
            .expect("valid array");
    assert_eq!(recipients.len(), 1);
    assert_eq!(recipients[0].email, "c@example.com");
}

#[test]
fn non_array_root_is_rejected() {
    assert!(matches!(
        parse_json_array(r#"{"email": "a@example.com"}"#),
        Err(RecipientError::NotAList)
    ));
}

#[test]
fn json_lines_report_bad_line() {
    let contents = "{\"email\": \"a@example.com\"}\n\n{\"email\": \n";
    match parse_json_lines(contents) {
        Err(RecipientError::Json { line, .. }) => assert_eq!(line, 3),
        other => panic!("expected JSON error, got {other:?}"),
    }
}

#[test]
fn load_picks_format_from_extension() {
    let dir = tempfile::tempdir().expect("temp dir");
    let lines = dir.path().join("list.jsonl");
    std::fs::write(
        &lines,
        "{\"email\": \"a@example.com\"}\n{\"email\": \"b@example.com\"}\n",
    )
    .expect("write jsonl");
    let array = dir.path().join("list.json");
    std::fs::write(&array, "[{\"email\": \"c@example.com\"}]").expect("write json");

    assert_eq!(load_recipients(&lines).expect("jsonl loads").len(), 2);
    assert_eq!(load_recipients(&array).expect("json loads").len(), 1);
    assert!(matches!(
        load_recipients(&dir.path().join("missing.json")),
        Err(RecipientError::Io { .. })
    ));
}

#[test]
fn csv_sniffs_semicolons_and_finds_e_mail_column() {
    let recipients = parse_csv("Name;E-mail;Plan\nAda;ada@example.com;pro\nNobody;;free\n")
        .expect("valid csv");

    assert_eq!(recipients.len(), 1);
    assert_eq!(recipients[0].email, "ada@example.com");
    assert_eq!(recipients[0].name.as_deref(), Some("Ada"));
    assert_eq!(recipients[0].attributes.get("Plan").map(String::as_str), Some("pro"));
    assert!(!recipients[0].attributes.contains_key("E-mail"));
}

#[test]
fn csv_falls_back_to_any_email_like_column() {
    let recipients = parse_csv("first_name,Contact Email,city\nBob,bob@example.com,Oslo\n")
        .expect("valid csv");

    assert_eq!(recipients.len(), 1);
    assert_eq!(recipients[0].email, "bob@example.com");
    assert_eq!(recipients[0].name, None);
    assert_eq!(recipients[0].attributes.get("first_name").map(String::as_str), Some("Bob"));
    assert_eq!(recipients[0].attributes.get("city").map(String::as_str), Some("Oslo"));
}

#[test]
fn csv_handles_quotes_tabs_and_byte_order_mark() {
    let quoted = parse_csv("email,name,note\n\"c@example.com\",\"Cy\",\"likes a, b\"\n")
        .expect("valid csv");
    assert_eq!(quoted[0].attributes.get("note").map(String::as_str), Some("likes a, b"));

    let tabbed = parse_csv("\u{feff}email\tname\nd@example.com\tDee\n").expect("valid tsv");
    assert_eq!(tabbed[0].email, "d@example.com");
    assert_eq!(tabbed[0].name.as_deref(), Some("Dee"));
}

#[test]
fn csv_without_email_column_is_rejected() {
    assert!(matches!(
        parse_csv("name,city\nAda,Oslo\n"),
        Err(RecipientError::NoEmailColumn)
    ));
}

#[test]
fn load_reads_csv_by_extension() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("list.CSV");
    std::fs::write(&path, "email,name\ne@example.com,Eve\nf@example.com,\n").expect("write csv");

    let recipients = load_recipients(&path).expect("csv loads");
    assert_eq!(recipients.len(), 2);
    assert_eq!(recipients[1].name, None);
}
