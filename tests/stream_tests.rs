use std::io::Cursor;
use std::sync::Arc;
use telemetry_pipeline::{
    FieldType, FieldValue, PacketDefinition, PacketReader, PacketWriter, SerializedPacket,
};

fn event_definition() -> Arc<PacketDefinition> {
    let mut def = PacketDefinition::new("EventPacket", 1);
    def.add_field("name", FieldType::String).unwrap();
    def.add_field("count", FieldType::Int32).unwrap();
    Arc::new(def)
}

fn event(definition: &Arc<PacketDefinition>, name: &str, count: i32) -> SerializedPacket {
    let mut record = SerializedPacket::new(Arc::clone(definition));
    record
        .set("name", FieldValue::String(Some(name.to_owned())))
        .unwrap();
    record.set("count", FieldValue::Int32(count)).unwrap();
    record
}

#[test]
fn test_stream_round_trip() {
    let definition = event_definition();
    let mut writer = PacketWriter::new(Vec::new());
    for i in 0..5 {
        writer.write(&event(&definition, "tick", i)).unwrap();
    }
    let bytes = writer.into_inner();

    let mut reader = PacketReader::new(Cursor::new(bytes));
    for i in 0..5 {
        let record = reader.read().unwrap().expect("packet should be present");
        assert_eq!(record.definition().type_name(), "EventPacket");
        assert_eq!(
            record.get("count").unwrap(),
            &FieldValue::Int32(i),
            "packets must come back in write order"
        );
    }
    assert!(reader.read().unwrap().is_none(), "clean end of stream");
}

#[test]
fn test_definition_written_once() {
    let definition = event_definition();
    let mut writer = PacketWriter::new(Vec::new());
    writer.write(&event(&definition, "a", 1)).unwrap();
    let first_len = writer.get_ref().len();
    writer.write(&event(&definition, "a", 2)).unwrap();
    let second_len = writer.get_ref().len() - first_len;
    assert_eq!(writer.definition_count(), 1);
    assert!(
        second_len < first_len,
        "second packet ({second_len} bytes) must skip the inline definition carried by the first ({first_len} bytes)"
    );

    // The reader registers it exactly once too.
    let mut reader = PacketReader::new(Cursor::new(writer.into_inner()));
    while reader.read().unwrap().is_some() {}
    assert_eq!(reader.definition_count(), 1);
}

#[test]
fn test_multiple_packet_types_interleave() {
    let events = event_definition();
    let mut other = PacketDefinition::new("MetricPacket", 1);
    other.add_field("value", FieldType::Double).unwrap();
    let metrics = Arc::new(other);

    let mut writer = PacketWriter::new(Vec::new());
    writer.write(&event(&events, "start", 1)).unwrap();
    let mut metric = SerializedPacket::new(Arc::clone(&metrics));
    metric.set("value", FieldValue::Double(2.5)).unwrap();
    writer.write(&metric).unwrap();
    writer.write(&event(&events, "stop", 2)).unwrap();
    assert_eq!(writer.definition_count(), 2);

    let mut reader = PacketReader::new(Cursor::new(writer.into_inner()));
    assert_eq!(
        reader.read().unwrap().unwrap().definition().type_name(),
        "EventPacket"
    );
    assert_eq!(
        reader.read().unwrap().unwrap().definition().type_name(),
        "MetricPacket"
    );
    assert_eq!(
        reader.read().unwrap().unwrap().definition().type_name(),
        "EventPacket"
    );
    assert!(reader.read().unwrap().is_none());
}

#[test]
fn test_definition_mismatch_rejected() {
    let mut writer = PacketWriter::new(Vec::new());
    writer.write(&event(&event_definition(), "ok", 1)).unwrap();

    // Same type name, different shape.
    let mut changed = PacketDefinition::new("EventPacket", 1);
    changed.add_field("name", FieldType::String).unwrap();
    changed.add_field("count", FieldType::Int64).unwrap();
    let mut record = SerializedPacket::new(Arc::new(changed));
    record
        .set("name", FieldValue::String(Some("bad".to_owned())))
        .unwrap();
    record.set("count", FieldValue::Int64(2)).unwrap();

    let err = writer.write(&record).unwrap_err();
    assert!(
        err.to_string().contains("EventPacket"),
        "error should name the conflicting type: {err}"
    );

    // The stream itself is untouched; the good definition still works.
    writer.write(&event(&event_definition(), "ok", 3)).unwrap();
    let mut reader = PacketReader::new(Cursor::new(writer.into_inner()));
    assert_eq!(reader.read().unwrap().unwrap().get("count").unwrap(), &FieldValue::Int32(1));
    assert_eq!(reader.read().unwrap().unwrap().get("count").unwrap(), &FieldValue::Int32(3));
    assert!(reader.read().unwrap().is_none());
}

#[test]
fn test_failed_write_rolls_back_string_table() {
    let definition = event_definition();
    let mut writer = PacketWriter::new(Vec::new());
    writer.write(&event(&definition, "shared", 1)).unwrap();

    // A record with an unassigned field fails mid-encode after its strings
    // may already have been interned.
    let mut incomplete = SerializedPacket::new(Arc::clone(&definition));
    incomplete
        .set("name", FieldValue::String(Some("doomed".to_owned())))
        .unwrap();
    assert!(writer.write(&incomplete).is_err());

    // Dedup still applies to committed strings, and the doomed string is
    // written in full when it legitimately appears later.
    writer.write(&event(&definition, "doomed", 2)).unwrap();
    writer.write(&event(&definition, "shared", 3)).unwrap();
    let bytes = writer.into_inner();
    let shared_count = bytes.windows(6).filter(|w| *w == b"shared").count();
    assert_eq!(shared_count, 1, "committed string stays deduplicated");

    let mut reader = PacketReader::new(Cursor::new(bytes));
    assert_eq!(
        reader.read().unwrap().unwrap().get("name").unwrap(),
        &FieldValue::String(Some("shared".to_owned()))
    );
    assert_eq!(
        reader.read().unwrap().unwrap().get("name").unwrap(),
        &FieldValue::String(Some("doomed".to_owned()))
    );
    assert_eq!(
        reader.read().unwrap().unwrap().get("name").unwrap(),
        &FieldValue::String(Some("shared".to_owned()))
    );
}

#[test]
fn test_truncated_stream_reports_framing_failure() {
    let definition = event_definition();
    let mut writer = PacketWriter::new(Vec::new());
    writer.write(&event(&definition, "whole", 1)).unwrap();
    writer.write(&event(&definition, "cut", 2)).unwrap();
    let mut bytes = writer.into_inner();
    bytes.truncate(bytes.len() - 2);

    let mut reader = PacketReader::new(Cursor::new(bytes));
    assert!(reader.read().unwrap().is_some(), "first packet is intact");
    assert!(reader.read().is_err(), "truncated body is a stream failure");
}

#[test]
fn test_empty_stream_is_clean_eof() {
    let mut reader = PacketReader::new(Cursor::new(Vec::new()));
    assert!(reader.read().unwrap().is_none());
}

#[test]
fn test_inherited_definition_round_trips() {
    let mut base = PacketDefinition::new("BasePacket", 1);
    base.add_field("sequence", FieldType::Int64).unwrap();
    let mut derived = PacketDefinition::new("DerivedPacket", 1).with_parent(base);
    derived.add_field("label", FieldType::String).unwrap();
    let derived = Arc::new(derived);

    let mut record = SerializedPacket::new(Arc::clone(&derived));
    record.set("sequence", FieldValue::Int64(7)).unwrap();
    record
        .set("label", FieldValue::String(Some("leaf".to_owned())))
        .unwrap();

    let mut writer = PacketWriter::new(Vec::new());
    writer.write(&record).unwrap();

    let mut reader = PacketReader::new(Cursor::new(writer.into_inner()));
    let decoded = reader.read().unwrap().unwrap();
    let definition = decoded.definition();
    assert_eq!(definition.nesting_depth(), 2);
    assert_eq!(definition.type_name(), "DerivedPacket");
    assert_eq!(
        definition.parent().map(|p| p.type_name()),
        Some("BasePacket"),
        "parent level survives the wire"
    );
    assert_eq!(decoded.get("sequence").unwrap(), &FieldValue::Int64(7));
    assert_eq!(
        decoded.get("label").unwrap(),
        &FieldValue::String(Some("leaf".to_owned()))
    );
}
