//! Text rendering of parsers, chunk histories and diffs.

use std::io::{self, Write};

use nvs_parser::diff::{BankDiff, ChunkDiff, ZoneDiff};
use nvs_parser::{Bank, Chunk, ChunkView, Mode, NvsParser, ParserDiff};

const CHUNK_SEPARATOR: &str = "\t\t--------------------";

/// Writes every zone of `parser`: the active bank, then the disabled one.
///
/// Zones without an active bank only print their heading. With a `mode`,
/// chunks listed in the view table are printed as decoded records.
pub fn print_nvs<W: Write>(parser: &NvsParser, mode: Option<Mode>, mut out: W) -> io::Result<()> {
    for zone in parser.zones() {
        writeln!(
            out,
            "==================== Zone {} at 0x{:08X} ====================",
            zone.number(),
            zone.start_address()
        )?;

        let Some(active) = zone.active_bank() else {
            continue;
        };
        print_bank(parser, "Active", active, mode, &mut out)?;

        if let Some(disabled) = zone.disabled_bank() {
            print_bank(parser, "Disabled", disabled, mode, &mut out)?;
        }
    }

    Ok(())
}

fn print_bank<W: Write>(
    parser: &NvsParser,
    label: &str,
    bank: &Bank,
    mode: Option<Mode>,
    out: &mut W,
) -> io::Result<()> {
    writeln!(
        out,
        "\t================== {label} Bank at 0x{:08X} ==================",
        bank.start_address()
    )?;

    for chunk in bank.chunks() {
        writeln!(
            out,
            "\t\tChunk ID : {} (0x{:02X})",
            parser.chunk_id_name(chunk.id()),
            chunk.id()
        )?;

        match parser.view_chunk(chunk, mode) {
            Ok(ChunkView::Decoded { record, .. }) => {
                for line in format!("{record:#?}").lines() {
                    writeln!(out, "\t\t{line}")?;
                }
            }
            Ok(ChunkView::Raw(_)) => print_raw(chunk, out)?,
            Err(e) => {
                tracing::warn!("chunk 0x{:02X}: {e}", chunk.id());
                print_raw(chunk, out)?;
            }
        }

        writeln!(out, "{CHUNK_SEPARATOR}\n")?;
    }

    Ok(())
}

fn print_raw<W: Write>(chunk: &Chunk, out: &mut W) -> io::Result<()> {
    match chunk.length() {
        Some(length) => writeln!(out, "\t\tChunk length : 0x{length:X}")?,
        None => writeln!(out, "\t\tChunk length : -")?,
    }
    match chunk.crc() {
        Some(crc) => writeln!(out, "\t\tChunk CRC : 0x{crc:04X}")?,
        None => writeln!(out, "\t\tChunk CRC : -")?,
    }
    writeln!(out, "\t\tChunk data : {:02X?}", chunk.payload())
}

/// Writes the zone and bank layout with bank usage.
pub fn print_layout<W: Write>(parser: &NvsParser, mut out: W) -> io::Result<()> {
    let map = parser.map();
    writeln!(out, "Chunk method:   {:?}", map.method())?;
    writeln!(out, "Word size:      {}", map.word_size())?;
    writeln!(out, "AES key:        {}", if parser.key().is_some() { "yes" } else { "no" })?;
    writeln!(out, "Zones:          {}", parser.zones().len())?;
    writeln!(out)?;

    writeln!(
        out,
        "{:>4}  {:>4}  {:>10}  {:>8}  {:>8}  {:>7}  State",
        "Zone", "Bank", "Address", "Capacity", "Used", "Records"
    )?;
    writeln!(
        out,
        "{:-<4}  {:-<4}  {:-<10}  {:-<8}  {:-<8}  {:-<7}  {:-<8}",
        "", "", "", "", "", "", ""
    )?;

    for zone in parser.zones() {
        for (index, bank) in zone.banks().iter().enumerate() {
            let Some(bank) = bank else {
                continue;
            };
            writeln!(
                out,
                "{:>4}  {:>4}  0x{:08X}  {:>8}  {:>8}  {:>7}  {}",
                zone.number(),
                index,
                bank.start_address(),
                bank.capacity(),
                bank.current_length(),
                bank.records().count(),
                if bank.active() { "active" } else { "disabled" }
            )?;
        }
    }

    Ok(())
}

/// Writes the occurrences of one chunk, oldest first.
pub fn print_history<W: Write>(views: &[ChunkView<'_>], mut out: W) -> io::Result<()> {
    if views.is_empty() {
        return writeln!(out, "No occurrence.");
    }

    for (index, view) in views.iter().enumerate() {
        let chunk = view.chunk();
        write!(out, "#{index:<3} ")?;
        match view.record() {
            Some(record) => writeln!(out, "{record:?}")?,
            None => writeln!(
                out,
                "length {} crc {} data {:02X?}",
                chunk.length().map_or_else(|| "-".to_owned(), |l| format!("0x{l:X}")),
                chunk.crc().map_or_else(|| "-".to_owned(), |c| format!("0x{c:04X}")),
                view.clear_payload()
            )?,
        }
    }

    Ok(())
}

/// Writes the differing nodes of a diff tree.
pub fn print_diff<W: Write>(diff: &ParserDiff, mut out: W) -> io::Result<()> {
    if !diff.fields.is_empty() {
        writeln!(out, "Parser: {:?}", diff.fields)?;
    }
    for zone in &diff.zones {
        print_zone_diff(zone, &mut out)?;
    }
    Ok(())
}

fn print_zone_diff<W: Write>(zone: &ZoneDiff, out: &mut W) -> io::Result<()> {
    match (zone.old, zone.new) {
        (Some(_), None) => writeln!(out, "Zone {}: removed", zone.index)?,
        (None, Some(_)) => writeln!(out, "Zone {}: added", zone.index)?,
        _ => writeln!(out, "Zone {}: {:?}", zone.index, zone.fields)?,
    }
    for bank in &zone.banks {
        print_bank_diff(bank, out)?;
    }
    Ok(())
}

fn print_bank_diff<W: Write>(bank: &BankDiff, out: &mut W) -> io::Result<()> {
    let label = bank
        .index
        .map_or_else(|| "expected active".to_owned(), |index| index.to_string());
    match (bank.old, bank.new) {
        (Some(_), None) => writeln!(out, "\tBank {label}: removed")?,
        (None, Some(_)) => writeln!(out, "\tBank {label}: added")?,
        _ => writeln!(out, "\tBank {label}: {:?}", bank.fields)?,
    }
    for chunk in &bank.chunks {
        print_chunk_diff(chunk, out)?;
    }
    Ok(())
}

fn print_chunk_diff<W: Write>(chunk: &ChunkDiff, out: &mut W) -> io::Result<()> {
    match (&chunk.old, &chunk.new) {
        (Some(old), None) => writeln!(out, "\t\tChunk {}: removed {old:?}", chunk.index),
        (None, Some(new)) => writeln!(out, "\t\tChunk {}: added {new:?}", chunk.index),
        (Some(old), Some(new)) => {
            writeln!(out, "\t\tChunk {}: {:?}", chunk.index, chunk.fields)?;
            writeln!(out, "\t\t\t- {old:?}")?;
            writeln!(out, "\t\t\t+ {new:?}")
        }
        (None, None) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use nvs_parser::{BankCapacity, ChunkIdMap, ChunkLocation, ChunkMethod, HistoryOptions};

    use super::*;

    fn parser() -> NvsParser {
        let map = ChunkIdMap::new(ChunkMethod::IdBased, 4)
            .unwrap()
            .with_chunk("NVS_CONNECT_ID", ChunkLocation::Id(0x22));
        let (mut parser, _) = NvsParser::from_memory_read(
            0x0002_0000,
            &[0xFF; 256],
            &BankCapacity::Uniform(128),
            map,
            None,
        )
        .unwrap();
        parser.activate_bank(0, 0).unwrap();
        parser.add_new_chunk("NVS_CONNECT_ID", &[0xAB, 0xCD], None).unwrap();
        parser
    }

    fn render(f: impl FnOnce(&mut Vec<u8>) -> io::Result<()>) -> String {
        let mut out = Vec::new();
        f(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn nvs_dump_lists_both_banks() {
        let parser = parser();
        let text = render(|out| print_nvs(&parser, None, out));

        assert!(text.contains("Zone 0 at 0x00020000"));
        assert!(text.contains("Active Bank at 0x00020000"));
        assert!(text.contains("Disabled Bank at 0x00020080"));
        assert!(text.contains("Chunk ID : NVS_CONNECT_ID (0x22)"));
        assert!(text.contains("Chunk length : 0x2"));
        assert!(text.contains("Chunk data : [AB, CD, 00, 00]"));
    }

    #[test]
    fn dump_skips_zone_without_active_bank() {
        let map = ChunkIdMap::new(ChunkMethod::IdBased, 4).unwrap();
        let (parser, _) = NvsParser::from_memory_read(
            0,
            &[0xFF; 256],
            &BankCapacity::Uniform(128),
            map,
            None,
        )
        .unwrap();

        let text = render(|out| print_nvs(&parser, Some(Mode::Device), out));
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn layout_table() {
        let parser = parser();
        let text = render(|out| print_layout(&parser, out));

        assert!(text.contains("Zones:          1"));
        let rows: Vec<&str> = text.lines().filter(|l| l.contains("0x0002")).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].ends_with("active"));
        assert!(rows[1].ends_with("disabled"));
    }

    #[test]
    fn history_lines() {
        let mut parser = parser();
        parser.add_new_chunk("NVS_CONNECT_ID", &[0x01], None).unwrap();
        let views = parser
            .get_chunk_history("NVS_CONNECT_ID", None, HistoryOptions::default())
            .unwrap();

        let text = render(|out| print_history(&views, out));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("#0"));
        assert!(lines[1].contains("[01]"));

        assert_eq!(render(|out| print_history(&[], out)), "No occurrence.\n");
    }

    #[test]
    fn diff_of_added_chunk() {
        let old = parser();
        let mut new = old.clone();
        new.add_new_chunk(0x23, &[0x01], None).unwrap();

        let diff = old.diff(&new, false, false).unwrap();
        let text = render(|out| print_diff(&diff, out));
        assert!(text.contains("Zone 0"));
        assert!(text.contains("added"));
    }
}
