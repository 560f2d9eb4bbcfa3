//! Partitioned disk images around volume images.

use anyhow::{Context, Result, ensure};
use pfs_partition::{
    GptLayout, MbrLayout, PartitionTable, PartitionTableEntry, PartitionType, TableKind,
    write_sectors,
};
use pfs_types::Guid;

const SECTOR_SIZE: u32 = 512;
/// Partitions start on 64-sector boundaries.
const ALIGNMENT: u64 = 64;
const MBR_EXTENDED_LBA: u8 = 0x0F;

/// A volume image to place in a partition.
#[derive(Debug, Clone, Copy)]
pub struct Part<'a, T> {
    pub type_tag: T,
    pub bytes: &'a [u8],
}

impl<'a, T> Part<'a, T> {
    pub fn new(type_tag: T, bytes: &'a [u8]) -> Self {
        Self { type_tag, bytes }
    }

    fn sectors(&self) -> u64 {
        (self.bytes.len() as u64).div_ceil(u64::from(SECTOR_SIZE))
    }
}

fn align(sector: u64) -> u64 {
    sector.next_multiple_of(ALIGNMENT)
}

fn entry(index: usize, start: u64, count: u64, type_tag: PartitionType) -> PartitionTableEntry {
    PartitionTableEntry {
        index,
        start_sector: start,
        sector_count: count,
        type_tag,
        boot_flag: false,
        name: None,
        child_table: None,
    }
}

fn place(image: &mut [u8], start: u64, bytes: &[u8]) -> Result<()> {
    let at = usize::try_from(start * u64::from(SECTOR_SIZE))?;
    let dst = image
        .get_mut(at..at + bytes.len())
        .context("partition outside the disk image")?;
    dst.copy_from_slice(bytes);
    Ok(())
}

/// An MBR disk with `primary` in slots 0.. and, when `logical` is not
/// empty, an extended partition holding them as a chain of boot records.
pub fn mbr_disk(primary: &[Part<'_, u8>], logical: &[Part<'_, u8>]) -> Result<Vec<u8>> {
    let slots = primary.len() + usize::from(!logical.is_empty());
    ensure!(slots <= 4, "{slots} primary slots requested, MBR holds 4");

    let mut table = PartitionTable::new(TableKind::Mbr);
    let mut placed = Vec::new();
    let mut cursor = ALIGNMENT;
    for (index, part) in primary.iter().enumerate() {
        table
            .entries
            .push(entry(index, cursor, part.sectors(), PartitionType::Mbr(part.type_tag)));
        placed.push((cursor, part.bytes));
        cursor = align(cursor + part.sectors());
    }

    if !logical.is_empty() {
        let extended_start = cursor;
        // Each logical partition sits one alignment unit after its boot record.
        let mut ebrs = Vec::with_capacity(logical.len());
        for part in logical {
            let ebr = cursor;
            let start = ebr + ALIGNMENT;
            ebrs.push((ebr, start, part));
            placed.push((start, part.bytes));
            cursor = align(start + part.sectors());
        }
        let mut child: Option<Box<PartitionTable>> = None;
        for (i, (_, start, part)) in ebrs.iter().enumerate().rev() {
            let mut link_table = PartitionTable::new(TableKind::MbrExtended);
            link_table.entries.push(entry(
                0,
                *start,
                part.sectors(),
                PartitionType::Mbr(part.type_tag),
            ));
            if let Some(next) = child.take() {
                let (next_ebr, next_end) = ebrs
                    .get(i + 1)
                    .map(|(ebr, start, part)| (*ebr, start + part.sectors()))
                    .context("extended chain out of order")?;
                let mut link = entry(
                    1,
                    next_ebr,
                    next_end - next_ebr,
                    PartitionType::Mbr(MBR_EXTENDED_LBA),
                );
                link.child_table = Some(next);
                link_table.entries.push(link);
            }
            child = Some(Box::new(link_table));
        }
        let mut extended = entry(
            primary.len(),
            extended_start,
            cursor - extended_start,
            PartitionType::Mbr(MBR_EXTENDED_LBA),
        );
        extended.child_table = child;
        table.entries.push(extended);
    }

    let mut image = vec![0_u8; usize::try_from((cursor + ALIGNMENT) * u64::from(SECTOR_SIZE))?];
    let sectors = MbrLayout::new(table)
        .with_disk_signature(0x5046_5331)
        .to_sectors()?;
    write_sectors(&mut image, SECTOR_SIZE, &sectors)?;
    for (start, bytes) in placed {
        place(&mut image, start, bytes)?;
    }
    Ok(image)
}

/// A GPT disk with one named partition per part, in slot order.
pub fn gpt_disk(parts: &[(Part<'_, Guid>, &str)]) -> Result<Vec<u8>> {
    let mut table = PartitionTable::new(TableKind::Gpt);
    let mut placed = Vec::new();
    let mut cursor = ALIGNMENT;
    for (index, (part, name)) in parts.iter().enumerate() {
        let mut gpt_entry = entry(index, cursor, part.sectors(), PartitionType::Gpt(part.type_tag));
        gpt_entry.name = Some((*name).to_owned());
        table.entries.push(gpt_entry);
        placed.push((cursor, part.bytes));
        cursor = align(cursor + part.sectors());
    }
    // Backup entry array and header.
    let total_sectors = cursor + ALIGNMENT;
    let disk_guid = Guid::from_fields(0x5046_5331, 0x0001, 0x4000, [0x80, 0, 0, 0, 0, 0, 0, 1]);
    let layout = GptLayout::from_table(&table, disk_guid, SECTOR_SIZE, total_sectors)?;

    let mut image = vec![0_u8; usize::try_from(total_sectors * u64::from(SECTOR_SIZE))?];
    write_sectors(&mut image, SECTOR_SIZE, &layout.to_sectors()?)?;
    for (start, bytes) in placed {
        place(&mut image, start, bytes)?;
    }
    Ok(image)
}
