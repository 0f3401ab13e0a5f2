// tests/property/roundtrip_test.rs

//! Encode-then-decode of every backup file section is bit-identical.

use peridotdb_backup::core::format::{
    FileHeader, FileType, FragmentFooter, FragmentHeader, FragmentInfo, GcpEntry, LogEntry,
    LogEventType, TableDescription, TableList, WordReader, bytes_to_words, words_to_bytes,
};
use proptest::prelude::*;

fn file_type_strategy() -> impl Strategy<Value = FileType> {
    prop_oneof![
        Just(FileType::Ctl),
        Just(FileType::Log),
        Just(FileType::Data),
        Just(FileType::Lcp),
        Just(FileType::UndoLog),
    ]
}

fn log_event_strategy() -> impl Strategy<Value = LogEventType> {
    prop_oneof![
        Just(LogEventType::Insert),
        Just(LogEventType::Update),
        Just(LogEventType::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_word_byte_round_trip(words in prop::collection::vec(any::<u32>(), 0..512)) {
        let bytes = words_to_bytes(&words);
        prop_assert_eq!(bytes_to_words(&bytes).unwrap(), words);
    }

    #[test]
    fn test_file_header_round_trip(
        file_type in file_type_strategy(),
        backup_id in any::<u32>(),
        key0 in any::<u32>(),
        key1 in any::<u32>(),
    ) {
        let header = FileHeader {
            file_type,
            backup_id,
            backup_key: (key0, key1),
            cluster_version: 0x90400,
            server_version: 0x90400,
        };
        let mut words = Vec::new();
        header.encode(&mut words);
        let decoded = FileHeader::decode(&mut WordReader::new(&words)).unwrap();
        prop_assert_eq!(decoded, header);
    }

    #[test]
    fn test_table_list_round_trip(ids in prop::collection::vec(any::<u32>(), 0..128)) {
        let list = TableList { table_ids: ids };
        let mut words = Vec::new();
        list.encode(&mut words);
        let decoded = TableList::decode(&mut WordReader::new(&words)).unwrap();
        prop_assert_eq!(decoded, list);
    }

    #[test]
    fn test_table_description_round_trip(
        table_type in any::<u32>(),
        data in prop::collection::vec(any::<u32>(), 0..256),
    ) {
        let desc = TableDescription { table_type, data };
        let mut words = Vec::new();
        desc.encode(&mut words);
        let decoded = TableDescription::decode(&mut WordReader::new(&words)).unwrap();
        prop_assert_eq!(decoded, desc);
    }

    #[test]
    fn test_fragment_info_round_trip(
        table_id in any::<u32>(),
        fragment_no in any::<u32>(),
        records in any::<u64>(),
    ) {
        let info = FragmentInfo { table_id, fragment_no, records };
        let mut words = Vec::new();
        info.encode(&mut words);
        let decoded = FragmentInfo::decode(&mut WordReader::new(&words)).unwrap();
        prop_assert_eq!(decoded, info);
    }

    #[test]
    fn test_gcp_entry_round_trip(start in any::<u32>(), stop in any::<u32>()) {
        let gcp = GcpEntry { start_gcp: start, stop_gcp: stop };
        let mut words = Vec::new();
        gcp.encode(&mut words);
        let decoded = GcpEntry::decode(&mut WordReader::new(&words)).unwrap();
        prop_assert_eq!(decoded, gcp);
    }

    #[test]
    fn test_fragment_framing_round_trip(
        table_id in any::<u32>(),
        fragment_no in any::<u32>(),
        records in any::<u32>(),
    ) {
        let head = FragmentHeader { table_id, fragment_no };
        let mut words = Vec::new();
        head.encode(&mut words);
        prop_assert_eq!(
            FragmentHeader::decode(&mut WordReader::new(&words)).unwrap(),
            head
        );

        let foot = FragmentFooter { table_id, fragment_no, records };
        let mut words = Vec::new();
        foot.encode(&mut words);
        prop_assert_eq!(
            FragmentFooter::decode(&mut WordReader::new(&words)).unwrap(),
            foot
        );
    }

    #[test]
    fn test_log_entry_round_trip(
        table_id in any::<u32>(),
        event in log_event_strategy(),
        fragment_id in any::<u32>(),
        data in prop::collection::vec(any::<u32>(), 0..64),
        gci in prop::option::of(any::<u32>()),
        undo in any::<bool>(),
    ) {
        let entry = LogEntry { table_id, event, fragment_id, data, gci };
        let mut words = Vec::new();
        entry.encode(undo, &mut words);
        prop_assert_eq!(words.len(), entry.encoded_words(undo));
        let decoded = LogEntry::decode(&mut WordReader::new(&words), undo)
            .unwrap()
            .unwrap();
        prop_assert_eq!(decoded, entry);
    }
}
