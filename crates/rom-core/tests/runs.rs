use pretty_assertions::assert_eq;
use rom_core::{
    CellFormat, Codec, CodecError, Conflict, Decompressed, Field, FieldKind, FormatDescriptor,
    Glyph, ModelDelta, ModelError, PointerTarget, RomModel, RunKind, TableLength, text,
};
use std::sync::Arc;

/// Length-prefixed "compression": one length byte followed by the raw content.
#[derive(Debug)]
struct Stored;

impl Codec for Stored {
    fn name(&self) -> &str {
        "stored"
    }

    fn decompress(&self, data: &[u8]) -> Option<Decompressed> {
        let len = usize::from(*data.first()?);
        let content = data.get(1..1 + len)?;
        Some(Decompressed {
            data: content.to_vec(),
            consumed: 1 + len,
        })
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let len = u8::try_from(data.len()).map_err(|_| CodecError::TooLarge {
            len: data.len(),
            max: 0xFF,
        })?;
        let mut out = vec![len];
        out.extend_from_slice(data);
        Ok(out)
    }
}

fn blank(len: usize) -> (RomModel, ModelDelta) {
    (RomModel::new(vec![0xFF; len]), ModelDelta::new())
}

fn word(name: &str, width: u8, offset: i32) -> FormatDescriptor {
    FormatDescriptor::Word {
        name: name.into(),
        width,
        offset,
    }
}

fn bytes_table(length: TableLength) -> FormatDescriptor {
    FormatDescriptor::Table {
        fields: vec![Field::new("id", FieldKind::Integer { width: 1 })],
        length,
    }
}

#[test]
fn test_pointer_creates_and_drops_placeholder() {
    let (mut model, mut tx) = blank(0x40);
    model.write_pointer(0x00, Some(0x20), &mut tx).unwrap();
    model.declare_run(0x00, FormatDescriptor::Pointer, &mut tx).unwrap();

    let placeholder = model.run_exactly_at(0x20).unwrap();
    assert!(placeholder.is_no_info());
    assert_eq!(placeholder.length(), 1);

    // Repointing moves the source; the anonymous placeholder goes away.
    model.write_pointer(0x00, Some(0x30), &mut tx).unwrap();
    assert!(model.run_exactly_at(0x20).is_none());
    assert!(model.run_exactly_at(0x30).unwrap().pointer_sources().contains(&0x00));

    model.write_pointer(0x00, None, &mut tx).unwrap();
    assert!(model.run_exactly_at(0x30).is_none());
    assert_eq!(model.read_pointer(0x00), PointerTarget::Null);
    model.check_consistency().unwrap();
}

#[test]
fn test_named_placeholder_survives_losing_sources() {
    let (mut model, mut tx) = blank(0x40);
    model.write_pointer(0x00, Some(0x20), &mut tx).unwrap();
    model.declare_run(0x00, FormatDescriptor::Pointer, &mut tx).unwrap();
    model.set_anchor(0x20, "target", &mut tx).unwrap();

    model.write_pointer(0x00, None, &mut tx).unwrap();
    let run = model.run_exactly_at(0x20).unwrap();
    assert!(run.is_no_info());
    assert!(run.pointer_sources().is_empty());
}

#[test]
fn test_pointer_into_middle_of_run_is_in_error() {
    let (mut model, mut tx) = blank(0x40);
    model
        .write_bytes(0x20, &text::encode("hello").unwrap(), &mut tx)
        .unwrap();
    model.declare_run(0x20, FormatDescriptor::Text, &mut tx).unwrap();
    model.write_pointer(0x00, Some(0x22), &mut tx).unwrap();
    model.declare_run(0x00, FormatDescriptor::Pointer, &mut tx).unwrap();

    assert!(model.run_exactly_at(0x00).unwrap().in_error());
    assert!(model.run_exactly_at(0x20).unwrap().pointer_sources().is_empty());

    model.write_pointer(0x00, Some(0x20), &mut tx).unwrap();
    assert!(!model.run_exactly_at(0x00).unwrap().in_error());
    model.check_consistency().unwrap();
}

#[test]
fn test_out_of_range_pointer_is_in_error() {
    let (mut model, mut tx) = blank(0x40);
    model
        .write_bytes(0x00, &0x0900_0000u32.to_le_bytes(), &mut tx)
        .unwrap();
    model.declare_run(0x00, FormatDescriptor::Pointer, &mut tx).unwrap();
    assert_eq!(model.read_pointer(0x00), PointerTarget::Invalid(0x0900_0000));
    assert!(model.run_exactly_at(0x00).unwrap().in_error());
}

#[test]
fn test_word_copies_mirror_each_other() {
    let (mut model, mut tx) = blank(0x40);
    let word = FormatDescriptor::Word {
        name: "max_level".into(),
        width: 1,
        offset: 0,
    };
    model.write_byte(0x10, 100, &mut tx).unwrap();
    model.declare_run(0x10, word.clone(), &mut tx).unwrap();
    model.declare_run(0x30, word, &mut tx).unwrap();
    assert_eq!(model.bytes()[0x30], 100);

    model.write_byte(0x30, 50, &mut tx).unwrap();
    assert_eq!(model.bytes()[0x10], 50);
    assert_eq!(
        model.format_at(0x10),
        CellFormat::Word {
            name: "max_level".into(),
            value: 50
        }
    );
}

#[test]
fn test_table_cells_describe_fields() {
    let (mut model, mut tx) = blank(0x40);
    model
        .set_list("types", vec!["Normal".into(), "Fire".into()], &mut tx)
        .unwrap();
    model.write_bytes(0x00, &[45, 0x01, 0x00, 7], &mut tx).unwrap();
    model
        .declare_run(
            0x00,
            FormatDescriptor::Table {
                fields: vec![
                    Field::new("hp", FieldKind::Integer { width: 1 }),
                    Field::new(
                        "type",
                        FieldKind::Enum {
                            list: "types".into(),
                            width: 2,
                        },
                    ),
                ],
                length: TableLength::Fixed(1),
            },
            &mut tx,
        )
        .unwrap();

    assert_eq!(
        model.format_at(0x00),
        CellFormat::Integer {
            element: 0,
            field: "hp".into(),
            value: 45
        }
    );
    assert_eq!(
        model.format_at(0x02),
        CellFormat::Enum {
            element: 0,
            field: "type".into(),
            value: 1,
            label: Some("Fire".into())
        }
    );
    assert_eq!(model.format_at(0x03), CellFormat::None);
}

#[test]
fn test_table_pointer_fields_are_tracked() {
    let (mut model, mut tx) = blank(0x40);
    for (slot, target) in [(0x00, 0x20), (0x04, 0x28)] {
        model.write_pointer(slot, Some(target), &mut tx).unwrap();
    }
    model
        .declare_run(
            0x00,
            FormatDescriptor::Table {
                fields: vec![Field::new("name", FieldKind::Pointer)],
                length: TableLength::Fixed(2),
            },
            &mut tx,
        )
        .unwrap();

    assert!(model.run_exactly_at(0x20).unwrap().pointer_sources().contains(&0x00));
    assert!(model.run_exactly_at(0x28).unwrap().pointer_sources().contains(&0x04));
    assert_eq!(
        model.format_at(0x05),
        CellFormat::Pointer {
            source: 0x04,
            target: PointerTarget::Address(0x28)
        }
    );

    model.clear_run(0x00, &mut tx).unwrap();
    assert!(model.run_exactly_at(0x20).is_none());
    assert!(model.run_exactly_at(0x28).is_none());
    model.check_consistency().unwrap();
}

#[test]
fn test_text_cells_and_shrinking() {
    let (mut model, mut tx) = blank(0x40);
    model
        .write_bytes(0x10, &text::encode("Hey\n").unwrap(), &mut tx)
        .unwrap();
    model.declare_run(0x10, FormatDescriptor::Text, &mut tx).unwrap();
    assert_eq!(model.format_at(0x10), CellFormat::Text(Glyph::Char('H')));
    assert_eq!(model.format_at(0x13), CellFormat::Text(Glyph::Newline));
    assert_eq!(model.format_at(0x14), CellFormat::Text(Glyph::Terminator));

    let start = model.write_text(0x10, "Y", &mut tx).unwrap();
    assert_eq!(start, 0x10);
    assert_eq!(model.run_exactly_at(0x10).unwrap().length(), 2);
    assert_eq!(&model.bytes()[0x12..0x15], &[0xFF; 3]);
    assert_eq!(model.read_text(0x10).unwrap(), "Y");
}

#[test]
fn test_unterminated_text_is_rejected() {
    let (mut model, mut tx) = blank(0x08);
    model.write_bytes(0x00, &[0xBB; 8], &mut tx).unwrap();
    let err = model
        .declare_run(0x00, FormatDescriptor::Text, &mut tx)
        .unwrap_err();
    assert_eq!(
        err,
        ModelError::InvalidData {
            address: 0,
            format: "text"
        }
    );
    assert_eq!(model.run_count(), 0);
}

#[test]
fn test_compressed_runs_use_the_codec() {
    let (model, mut tx) = blank(0x40);
    let mut model = model.with_codec(Arc::new(Stored));
    model.write_bytes(0x08, &[3, 1, 2, 3], &mut tx).unwrap();
    model
        .declare_run(0x08, FormatDescriptor::Compressed, &mut tx)
        .unwrap();

    let run = model.run_exactly_at(0x08).unwrap();
    assert_eq!(run.length(), 4);
    assert_eq!(run.kind(), &RunKind::Compressed { decompressed_len: 3 });
    assert_eq!(model.read_compressed(0x08).unwrap(), vec![1, 2, 3]);

    model.write_compressed(0x08, &[9, 9], &mut tx).unwrap();
    let run = model.run_exactly_at(0x08).unwrap();
    assert_eq!(run.length(), 3);
    assert_eq!(run.kind(), &RunKind::Compressed { decompressed_len: 2 });
    assert_eq!(model.bytes()[0x0B], 0xFF);
}

#[test]
fn test_compressed_without_codec_fails() {
    let (mut model, mut tx) = blank(0x10);
    let err = model
        .declare_run(0x00, FormatDescriptor::Compressed, &mut tx)
        .unwrap_err();
    assert_eq!(err, ModelError::Codec(CodecError::Unavailable));
}

#[test]
fn test_word_copies_must_share_a_width() {
    let (mut model, mut tx) = blank(0x100);
    model.declare_run(0x10, word("cap", 4, 0), &mut tx).unwrap();
    assert_eq!(
        model.declare_run(0x20, word("cap", 1, 0), &mut tx),
        Err(ModelError::WordWidth {
            name: "cap".into(),
            expected: 4,
            found: 1
        })
    );
    assert!(model.run_exactly_at(0x20).is_none());

    model.write_pointer(0x21, Some(0x80), &mut tx).unwrap();
    model.declare_run(0x21, FormatDescriptor::Pointer, &mut tx).unwrap();
    model.declare_run(0x30, word("cap", 4, 0), &mut tx).unwrap();
    model.write_value(0x10, 4, 5, &mut tx).unwrap();

    assert_eq!(model.read_value(0x30, 4).unwrap(), 5);
    assert_eq!(model.read_pointer(0x21), PointerTarget::Address(0x80));
    model.check_consistency().unwrap();
}

#[test]
fn test_word_offsets_shift_each_copy() {
    let (mut model, mut tx) = blank(0x40);
    model.write_byte(0x10, 10, &mut tx).unwrap();
    model.declare_run(0x10, word("count", 1, 0), &mut tx).unwrap();
    model.declare_run(0x20, word("count", 1, -1), &mut tx).unwrap();
    model.declare_run(0x30, word("count", 1, 1), &mut tx).unwrap();
    assert_eq!(model.bytes()[0x20], 9);
    assert_eq!(model.bytes()[0x30], 11);

    model.write_byte(0x20, 20, &mut tx).unwrap();
    assert_eq!(model.bytes()[0x10], 21);
    assert_eq!(model.bytes()[0x30], 22);

    // Fixed-width values wrap.
    model.write_byte(0x10, 0, &mut tx).unwrap();
    assert_eq!(model.bytes()[0x20], 0xFF);
    assert_eq!(model.bytes()[0x30], 1);
    model.check_consistency().unwrap();

    let _redo = tx.revert(&mut model);
    assert_eq!(model.bytes(), &[0xFF; 0x40][..]);
    assert_eq!(model.run_count(), 0);
}

#[test]
fn test_word_offset_is_omitted_when_zero() {
    let plain = serde_json::to_string(&word("cap", 1, 0)).unwrap();
    assert!(!plain.contains("offset"), "{plain}");
    let shifted = serde_json::to_string(&word("cap", 1, -1)).unwrap();
    assert!(shifted.contains("\"offset\":-1"), "{shifted}");
    let parsed: FormatDescriptor = serde_json::from_str(&plain).unwrap();
    assert_eq!(parsed, word("cap", 1, 0));
}

#[test]
fn test_empty_table_cannot_split_a_run() {
    let (mut model, mut tx) = blank(0x40);
    model
        .write_bytes(0x10, &text::encode("abcdefg").unwrap(), &mut tx)
        .unwrap();
    model.declare_run(0x10, FormatDescriptor::Text, &mut tx).unwrap();

    assert_eq!(
        model.declare_run(0x12, bytes_table(TableLength::Fixed(0)), &mut tx),
        Err(ModelError::StructuralConflict {
            start: 0x12,
            end: 0x12,
            conflict: Conflict::Run {
                start: 0x10,
                length: 8
            }
        })
    );
    assert_eq!(model.run_containing(0x14).map(|run| run.start()), Some(0x10));

    // Outside other runs an empty table is fine, and it still blocks later declarations.
    model
        .declare_run(0x30, bytes_table(TableLength::Fixed(0)), &mut tx)
        .unwrap();
    model
        .write_bytes(0x2E, &text::encode("abcd").unwrap(), &mut tx)
        .unwrap();
    assert!(matches!(
        model.declare_run(0x2E, FormatDescriptor::Text, &mut tx),
        Err(ModelError::StructuralConflict {
            conflict: Conflict::Run { start: 0x30, length: 0 },
            ..
        })
    ));
    model.check_consistency().unwrap();

    model.clear_run(0x30, &mut tx).unwrap();
    assert!(model.run_exactly_at(0x30).is_none());
}

#[test]
fn test_lost_terminator_marks_text_in_error() {
    let (mut model, mut tx) = blank(0x40);
    model
        .write_bytes(0x10, &text::encode("abc").unwrap(), &mut tx)
        .unwrap();
    model.declare_run(0x10, FormatDescriptor::Text, &mut tx).unwrap();
    model
        .write_bytes(0x14, &text::encode("Z").unwrap(), &mut tx)
        .unwrap();
    model.declare_run(0x14, FormatDescriptor::Text, &mut tx).unwrap();

    model.write_byte(0x13, 0xBB, &mut tx).unwrap();
    let run = model.run_exactly_at(0x10).unwrap();
    assert_eq!(run.length(), 4);
    assert!(run.in_error());
    assert_eq!(
        model.read_text(0x10),
        Err(ModelError::InvalidData {
            address: 0x10,
            format: "text"
        })
    );
    assert!(!model.run_exactly_at(0x14).unwrap().in_error());

    model.write_byte(0x13, 0xFF, &mut tx).unwrap();
    assert!(!model.run_exactly_at(0x10).unwrap().in_error());
    assert_eq!(model.read_text(0x10).unwrap(), "abc");
}

#[test]
fn test_extreme_matching_offsets_do_not_overflow() {
    let (mut model, mut tx) = blank(0x40);
    model.write_bytes(0x00, &[1, 2], &mut tx).unwrap();
    model.set_anchor(0x00, "species", &mut tx).unwrap();
    model
        .declare_run(0x00, bytes_table(TableLength::Fixed(2)), &mut tx)
        .unwrap();

    let matching = |offset| {
        bytes_table(TableLength::Matching {
            anchor: "species".into(),
            offset,
        })
    };
    assert!(matches!(
        model.declare_run(0x10, matching(i64::MAX), &mut tx),
        Err(ModelError::OutOfBounds { .. })
    ));
    model.declare_run(0x10, matching(i64::MIN), &mut tx).unwrap();
    assert_eq!(model.run_exactly_at(0x10).unwrap().length(), 0);
    model.check_consistency().unwrap();
}
