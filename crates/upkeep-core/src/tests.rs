use super::*;
use crate::tlv::{encode_utf16le, FieldWriter};

fn sample_registry_changes() -> Vec<RegistryChange> {
    vec![
        RegistryChange::create_key(RegistryRoot::CurrentUser, "Software\\Acme\\Widget"),
        RegistryChange::create_value(
            RegistryRoot::CurrentUser,
            "Software\\Acme\\Widget",
            Some("Version"),
            RegistryValue::String("2.0".to_string()),
        )
        .expect("valid change"),
        RegistryChange::create_value(
            RegistryRoot::LocalMachine,
            "Software\\Acme",
            None,
            RegistryValue::DWord(42),
        )
        .expect("valid change")
        .in_32bit_view(true),
        RegistryChange::create_value(
            RegistryRoot::CurrentUser,
            "Software\\Acme",
            Some("Paths"),
            RegistryValue::MultiString(vec!["a".to_string(), "b".to_string()]),
        )
        .expect("valid change"),
        RegistryChange::remove_value(RegistryRoot::CurrentUser, "Software\\Acme", Some("Old")),
        RegistryChange::remove_key(RegistryRoot::ClassesRoot, "Acme.Document"),
    ]
}

fn full_details() -> UpdateDetails {
    let mut patched = FileChange::new("bin\\widget.dll");
    patched.delta_patch_relative_path = Some("patches/widget.dll.patch".to_string());
    patched.new_file_sha256 = Some("ab".repeat(32));
    patched.is_managed_assembly = true;
    patched.cpu_arch = CpuArch::X64;
    patched.framework_version = FrameworkVersion::Net40;
    patched.com_registration = ComRegistration::IS_ASSEMBLY | ComRegistration::REGISTER;

    let mut runner = FileChange::new("setup-helper.exe");
    runner.execute = true;
    runner.execute_before_update = true;
    runner.wait_for_execution = true;
    runner.rollback_on_non_zero_exit = true;
    runner.command_line_args = Some("/quiet".to_string());
    runner.elevation = ElevationType::Elevated;

    let mut removed = FileChange::new("legacy.txt");
    removed.delete_file = true;

    UpdateDetails {
        registry_changes: sample_registry_changes(),
        shortcuts: vec![ShortcutRecord {
            target_path: Some("C:\\Program Files\\Acme\\widget.exe".to_string()),
            working_directory: Some("C:\\Program Files\\Acme".to_string()),
            arguments: Some("--tray".to_string()),
            description: Some("Acme Widget".to_string()),
            icon_path: Some("C:\\Program Files\\Acme\\widget.ico".to_string()),
            icon_index: Some(1),
            window_style: Some(7),
            relative_output_path: Some("Acme\\Widget.lnk".to_string()),
        }],
        previous_shortcuts: vec!["Acme\\Widget (old).lnk".to_string()],
        file_changes: vec![patched, runner, removed],
        folders_to_delete: vec!["plugins\\deprecated".to_string()],
        services_to_stop: vec!["AcmeSync".to_string()],
        services_to_start: vec![
            ServiceStart {
                name: "AcmeSync".to_string(),
                arguments: vec!["--resume".to_string(), "--quiet".to_string()],
            },
            ServiceStart::new("AcmeAgent"),
        ],
    }
}

#[test]
fn registry_change_round_trip() {
    for change in sample_registry_changes() {
        let decoded = RegistryChange::decode(&change.encode()).expect("must decode");
        assert_eq!(decoded, change);
    }
}

#[test]
fn registry_change_binary_and_qword_round_trip() {
    let binary = RegistryChange::create_value(
        RegistryRoot::CurrentUser,
        "Software\\Acme",
        Some("Blob"),
        RegistryValue::Binary(vec![0, 1, 2, 255]),
    )
    .expect("valid change");
    let qword = RegistryChange::create_value(
        RegistryRoot::CurrentUser,
        "Software\\Acme",
        Some("Big"),
        RegistryValue::QWord(u64::MAX - 3),
    )
    .expect("valid change");
    let expand = RegistryChange::create_value(
        RegistryRoot::CurrentUser,
        "Software\\Acme",
        Some("Home"),
        RegistryValue::ExpandString("%USERPROFILE%\\acme".to_string()),
    )
    .expect("valid change");
    for change in [binary, qword, expand] {
        assert_eq!(
            RegistryChange::decode(&change.encode()).expect("must decode"),
            change
        );
    }
}

#[test]
fn multi_string_keeps_empty_items() {
    let lists: [Vec<&str>; 4] = [vec![], vec![""], vec!["a", ""], vec!["", "", "b"]];
    for items in lists {
        let value = RegistryValue::MultiString(items.iter().map(|item| item.to_string()).collect());
        let change = RegistryChange::create_value(
            RegistryRoot::CurrentUser,
            "Software\\Acme",
            Some("Paths"),
            value,
        )
        .expect("valid change");
        assert_eq!(
            RegistryChange::decode(&change.encode()).expect("must decode"),
            change,
            "{items:?}"
        );
    }
}

#[test]
fn multi_string_reads_separator_only_data() {
    let mut out = FieldWriter::new();
    out.marker(0x8E);
    out.i32(0x01, RegistryOperation::CreateValue.code());
    out.i32(0x02, RegistryRoot::CurrentUser.code());
    out.string(0x03, "Software\\Acme");
    out.string(0x04, "Paths");
    out.i32(0x05, RegistryValueKind::MultiString.code());
    out.bytes(0x06, b"a\0b");
    out.marker(0x9E);
    let decoded = RegistryChange::decode(&out.into_bytes()).expect("must decode");
    assert_eq!(
        decoded.value,
        RegistryValue::MultiString(vec!["a".to_string(), "b".to_string()])
    );
}

#[test]
fn create_value_without_data_is_rejected() {
    let err = RegistryChange::create_value(
        RegistryRoot::CurrentUser,
        "Software\\Acme",
        Some("Version"),
        RegistryValue::None,
    )
    .expect_err("must reject");
    assert!(err.reason().contains("CreateValue"));

    let mut out = FieldWriter::new();
    out.marker(0x8E);
    out.i32(0x01, RegistryOperation::CreateValue.code());
    out.i32(0x02, RegistryRoot::CurrentUser.code());
    out.string(0x03, "Software\\Acme");
    out.marker(0x9E);
    assert!(RegistryChange::decode(&out.into_bytes()).is_err());
}

#[test]
fn registry_data_width_must_match_kind() {
    let mut out = FieldWriter::new();
    out.marker(0x8E);
    out.i32(0x01, RegistryOperation::CreateValue.code());
    out.i32(0x02, RegistryRoot::CurrentUser.code());
    out.string(0x03, "Software\\Acme");
    out.i32(0x05, RegistryValueKind::DWord.code());
    out.bytes(0x06, &[1, 2]);
    out.marker(0x9E);
    assert!(RegistryChange::decode(&out.into_bytes()).is_err());
}

#[test]
fn registry_change_decodes_legacy_utf16_fields() {
    let mut out = FieldWriter::new();
    out.marker(0x8E);
    out.i32(0x01, RegistryOperation::CreateValue.code());
    out.i32(0x02, RegistryRoot::CurrentUser.code());
    out.bytes(0x83, &encode_utf16le("Software\\Acme"));
    out.bytes(0x84, &encode_utf16le("Version"));
    out.i32(0x05, RegistryValueKind::String.code());
    out.bytes(0x86, &encode_utf16le("1.5"));
    out.marker(0x9E);

    let decoded = RegistryChange::decode(&out.into_bytes()).expect("legacy record decodes");
    let expected = RegistryChange::create_value(
        RegistryRoot::CurrentUser,
        "Software\\Acme",
        Some("Version"),
        RegistryValue::String("1.5".to_string()),
    )
    .expect("valid change");
    assert_eq!(decoded, expected);
    assert_eq!(decoded.encode(), expected.encode());
}

#[test]
fn unknown_tag_between_known_tags_is_ignored() {
    let build = |with_unknown: bool| {
        let mut out = FieldWriter::new();
        out.marker(0x8E);
        out.i32(0x01, RegistryOperation::CreateKey.code());
        if with_unknown {
            out.bytes(0x5A, b"added by a newer writer");
        }
        out.i32(0x02, RegistryRoot::CurrentUser.code());
        if with_unknown {
            out.i64(0x5B, 99);
        }
        out.string(0x03, "Software\\Acme");
        out.marker(0x9E);
        out.into_bytes()
    };

    let plain = RegistryChange::decode(&build(false)).expect("plain decodes");
    let extended = RegistryChange::decode(&build(true)).expect("extended decodes");
    assert_eq!(plain, extended);
}

#[test]
fn shortcut_round_trip_all_fields_and_none() {
    let details = full_details();
    let shortcut = details.shortcuts[0].clone();
    assert_eq!(
        ShortcutRecord::decode(&shortcut.encode()).expect("must decode"),
        shortcut
    );

    let empty = ShortcutRecord::default();
    let bytes = empty.encode();
    assert_eq!(bytes, vec![0x8D, 0x9A]);
    assert_eq!(ShortcutRecord::decode(&bytes).expect("must decode"), empty);
}

#[test]
fn file_change_round_trip_all_fields_and_minimal() {
    for change in full_details().file_changes {
        assert_eq!(
            FileChange::decode(&change.encode()).expect("must decode"),
            change
        );
    }

    let minimal = FileChange::new("readme.txt");
    assert_eq!(
        FileChange::decode(&minimal.encode()).expect("must decode"),
        minimal
    );
}

#[test]
fn file_change_rejects_delete_with_patch() {
    let mut change = FileChange::new("widget.dll");
    change.delete_file = true;
    change.delta_patch_relative_path = Some("widget.patch".to_string());
    let err = FileChange::decode(&change.encode()).expect_err("must reject");
    assert!(err.reason().contains("deletes and patches"));
}

#[test]
fn file_change_legacy_relative_path() {
    let mut out = FieldWriter::new();
    out.marker(0x8B);
    out.bytes(0x81, &encode_utf16le("bin\\tool.exe"));
    out.bool(0x02, true);
    out.marker(0x9B);
    let decoded = FileChange::decode(&out.into_bytes()).expect("must decode");
    assert_eq!(decoded.relative_path, "bin\\tool.exe");
    assert!(decoded.execute);
}

#[test]
fn file_change_resolves_either_separator() {
    let root = std::path::Path::new("/opt/acme");
    assert_eq!(
        FileChange::new("bin\\sub/tool.exe").resolve(root),
        root.join("bin").join("sub").join("tool.exe")
    );
}

#[test]
fn update_details_round_trip_full_and_empty() {
    let details = full_details();
    assert_eq!(
        UpdateDetails::from_bytes(&details.to_bytes()).expect("must decode"),
        details
    );

    let empty = UpdateDetails::default();
    let bytes = empty.to_bytes();
    assert_eq!(&bytes[..UPDATE_DETAILS_MAGIC.len()], UPDATE_DETAILS_MAGIC);
    assert_eq!(bytes.len(), UPDATE_DETAILS_MAGIC.len() + 1);
    let decoded = UpdateDetails::from_bytes(&bytes).expect("must decode");
    assert!(decoded.is_empty());
}

#[test]
fn update_details_rejects_count_mismatch() {
    let mut out = FieldWriter::with_header(UPDATE_DETAILS_MAGIC);
    out.i32(0x20, 2);
    RegistryChange::create_key(RegistryRoot::CurrentUser, "Software\\Acme")
        .write_nested(0x21, &mut out);
    out.marker(tlv::END_MARKER);
    assert!(UpdateDetails::from_bytes(&out.into_bytes()).is_err());
}

#[test]
fn update_details_rejects_bad_header_and_truncation() {
    let bytes = full_details().to_bytes();
    let mut wrong_header = bytes.clone();
    wrong_header[0] = b'X';
    assert!(UpdateDetails::from_bytes(&wrong_header).is_err());

    for cut in [UPDATE_DETAILS_MAGIC.len(), bytes.len() / 2, bytes.len() - 1] {
        let err = UpdateDetails::from_bytes(&bytes[..cut]).expect_err("truncated must fail");
        assert!(err.is_truncation(), "cut at {cut}: {err}");
    }
}

#[test]
fn update_details_skips_unknown_top_level_fields() {
    let details = full_details();
    let bytes = details.to_bytes();
    let mut extended = bytes[..UPDATE_DETAILS_MAGIC.len()].to_vec();
    let mut extra = FieldWriter::new();
    extra.string(0x70, "new field");
    extended.extend_from_slice(&extra.into_bytes());
    extended.extend_from_slice(&bytes[UPDATE_DETAILS_MAGIC.len()..]);
    assert_eq!(
        UpdateDetails::from_bytes(&extended).expect("must decode"),
        details
    );
}

#[test]
fn update_details_save_and_load() {
    let path = std::env::temp_dir().join(format!(
        "upkeep-core-tests-{}-{}.udt",
        std::process::id(),
        Timestamp::now().ticks()
    ));
    let details = full_details();
    details.save(&path).expect("must save");
    assert_eq!(UpdateDetails::load(&path).expect("must load"), details);
    let _ = std::fs::remove_file(&path);
}
