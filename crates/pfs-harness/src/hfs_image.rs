//! HFS+ and HFSX volume builder.
//!
//! Layout: boot blocks and the volume header, the allocation bitmap, file
//! data, the extents overflow tree, the catalog tree, spare blocks, and the
//! alternate volume header in the last kilobyte. Both trees are contiguous.

use crate::{FIXTURE_TIME, TreeNode};
use anyhow::{Context, Result, bail, ensure};
use pfs_ondisk::hfsplus::{
    BT_BIG_KEYS_MASK, BT_VARIABLE_INDEX_KEYS_MASK, BTreeHeaderRecord, CATALOG_KEY_MAX_LENGTH,
    CatalogDates, CatalogFile, CatalogFolder, CatalogKey, CatalogRecord, CatalogThread,
    EXTENT_DESCRIPTOR_SIZE, EXTENT_KEY_LENGTH, EXTENT_RECORD_LEN, ExtentKey, ForkType,
    HEADER_RECORD_SIZE, HFSPLUS_SIGNATURE, HFSPLUS_VERSION, HFSX_SIGNATURE, HFSX_VERSION,
    HfsPlusExtentDescriptor, HfsPlusForkData, HfsPlusVolumeHeader, KEY_COMPARE_BINARY,
    KEY_COMPARE_CASE_FOLDING, KeyCompare, NODE_DESCRIPTOR_SIZE, NodeDescriptor, NodeKind,
    VOLUME_HEADER_OFFSET, VOLUME_HEADER_SIZE, encode_node, unix_to_hfs_time,
    write_extent_record,
};
use pfs_types::CatalogNodeId;
use std::cmp::Ordering;
use tracing::debug;

const EXTENTS_NODE_SIZE: u16 = 512;
const USER_DATA_RECORD_SIZE: usize = 128;
const VOLUME_UNMOUNTED: u32 = 1 << 8;
/// "10.0"
const LAST_MOUNTED_VERSION: u32 = 0x3130_2E30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HfsImageOptions {
    pub label: String,
    pub block_size: u32,
    pub catalog_node_size: u16,
    /// Build an HFSX volume with binary (case-sensitive) name ordering.
    pub case_sensitive: bool,
    /// Leave a free block after each block of a multi-block file so every
    /// block becomes its own extent.
    pub fragment_files: bool,
    /// Free blocks left before the alternate header.
    pub spare_blocks: u32,
}

impl Default for HfsImageOptions {
    fn default() -> Self {
        Self {
            label: "TESTVOL".to_owned(),
            block_size: 4096,
            catalog_node_size: 4096,
            case_sensitive: false,
            fragment_files: false,
            spare_blocks: 16,
        }
    }
}

/// A built volume and the header written into it.
#[derive(Debug, Clone)]
pub struct HfsImage {
    pub bytes: Vec<u8>,
    pub header: HfsPlusVolumeHeader,
    pub catalog_node_size: u16,
}

impl HfsImage {
    /// Byte offset of catalog node `node` within [`Self::bytes`].
    #[must_use]
    pub fn catalog_node_offset(&self, node: u32) -> usize {
        let start = self.header.catalog_file.extents[0].start_block as usize;
        start * self.header.block_size as usize + node as usize * usize::from(self.catalog_node_size)
    }
}

struct PlannedFolder {
    id: CatalogNodeId,
    parent: CatalogNodeId,
    name: String,
    valence: u32,
}

struct PlannedFile<'a> {
    id: CatalogNodeId,
    parent: CatalogNodeId,
    name: String,
    data: &'a [u8],
    extents: Vec<HfsPlusExtentDescriptor>,
}

impl PlannedFile<'_> {
    fn blocks(&self) -> u32 {
        self.extents.iter().map(|ext| ext.block_count).sum()
    }

    fn inline_extents(&self) -> [HfsPlusExtentDescriptor; EXTENT_RECORD_LEN] {
        let mut out = [HfsPlusExtentDescriptor::default(); EXTENT_RECORD_LEN];
        for (slot, ext) in out.iter_mut().zip(&self.extents) {
            *slot = *ext;
        }
        out
    }
}

fn collect<'a>(
    nodes: &'a [TreeNode],
    parent: CatalogNodeId,
    next_id: &mut u32,
    folders: &mut Vec<PlannedFolder>,
    files: &mut Vec<PlannedFile<'a>>,
) -> Result<()> {
    for node in nodes {
        let id = CatalogNodeId(*next_id);
        *next_id = next_id.checked_add(1).context("catalog node ids exhausted")?;
        match node {
            TreeNode::Directory { name, children } => {
                folders.push(PlannedFolder {
                    id,
                    parent,
                    name: name.clone(),
                    valence: u32::try_from(children.len())?,
                });
                collect(children, id, next_id, folders, files)?;
            }
            TreeNode::File { name, data } => files.push(PlannedFile {
                id,
                parent,
                name: name.clone(),
                data,
                extents: Vec::new(),
            }),
        }
    }
    Ok(())
}

/// Lay `tree` out as a fresh HFS+ (or HFSX) volume.
pub fn build_hfsplus(tree: &[TreeNode], options: &HfsImageOptions) -> Result<HfsImage> {
    let bs = options.block_size;
    ensure!(
        bs >= 512 && bs.is_power_of_two(),
        "block size {bs} is not a power of two >= 512"
    );
    let mut folders = Vec::new();
    let mut files = Vec::new();
    let mut next_id = CatalogNodeId::FIRST_USER.0;
    collect(
        tree,
        CatalogNodeId::ROOT_FOLDER,
        &mut next_id,
        &mut folders,
        &mut files,
    )?;

    let mode = if options.case_sensitive {
        KeyCompare::Binary
    } else {
        KeyCompare::CaseFolding
    };
    let extents_params = TreeParams {
        node_size: EXTENTS_NODE_SIZE,
        block_size: bs,
        max_key_length: EXTENT_KEY_LENGTH,
        key_compare_type: 0,
        attributes: BT_BIG_KEYS_MASK,
    };
    let catalog_params = TreeParams {
        node_size: options.catalog_node_size,
        block_size: bs,
        max_key_length: CATALOG_KEY_MAX_LENGTH,
        key_compare_type: if options.case_sensitive {
            KEY_COMPARE_BINARY
        } else {
            KEY_COMPARE_CASE_FOLDING
        },
        attributes: BT_BIG_KEYS_MASK | BT_VARIABLE_INDEX_KEYS_MASK,
    };

    let reserved = u32::try_from(VOLUME_HEADER_OFFSET + VOLUME_HEADER_SIZE)?.div_ceil(bs);
    let tail = 1024_u32.div_ceil(bs);
    let mut bitmap_blocks = 1_u32;
    loop {
        let mut cursor = reserved + bitmap_blocks;
        let mut used = reserved + bitmap_blocks + tail;
        for file in &mut files {
            used += allocate(file, &mut cursor, bs, options.fragment_files)?;
        }
        let next_allocation = cursor;

        let extents_tree = build_tree(&extents_params, extents_records(&files)?)?;
        let extents_blocks = u32::try_from(extents_tree.len() / bs as usize)?;
        let extents_start = cursor;
        cursor += extents_blocks;

        let catalog_tree = build_tree(
            &catalog_params,
            catalog_records(&options.label, &folders, &files, mode)?,
        )?;
        let catalog_blocks = u32::try_from(catalog_tree.len() / bs as usize)?;
        let catalog_start = cursor;
        cursor += catalog_blocks;
        used += extents_blocks + catalog_blocks;

        let total = cursor + options.spare_blocks + tail;
        let needed = total.div_ceil(8).div_ceil(bs);
        if needed > bitmap_blocks {
            bitmap_blocks = needed;
            continue;
        }

        let t = unix_to_hfs_time(FIXTURE_TIME);
        let header = HfsPlusVolumeHeader {
            signature: if options.case_sensitive {
                HFSX_SIGNATURE
            } else {
                HFSPLUS_SIGNATURE
            },
            version: if options.case_sensitive {
                HFSX_VERSION
            } else {
                HFSPLUS_VERSION
            },
            attributes: VOLUME_UNMOUNTED,
            last_mounted_version: LAST_MOUNTED_VERSION,
            journal_info_block: 0,
            create_date: t,
            modify_date: t,
            backup_date: 0,
            checked_date: t,
            file_count: u32::try_from(files.len())?,
            folder_count: u32::try_from(folders.len())?,
            block_size: bs,
            total_blocks: total,
            free_blocks: total - used,
            next_allocation,
            rsrc_clump_size: bs,
            data_clump_size: bs,
            next_catalog_id: next_id,
            write_count: 1,
            encodings_bitmap: 1,
            finder_info: [0; 8],
            allocation_file: contiguous_fork(reserved, bitmap_blocks, bs),
            extents_file: contiguous_fork(extents_start, extents_blocks, bs),
            catalog_file: contiguous_fork(catalog_start, catalog_blocks, bs),
            attributes_file: HfsPlusForkData::default(),
            startup_file: HfsPlusForkData::default(),
        };

        let at = |block: u32| block as usize * bs as usize;
        let mut bytes = vec![0_u8; at(total)];
        let encoded = header.to_bytes()?;
        bytes[VOLUME_HEADER_OFFSET..VOLUME_HEADER_OFFSET + VOLUME_HEADER_SIZE]
            .copy_from_slice(&encoded);
        let alternate = bytes.len() - 1024;
        bytes[alternate..alternate + VOLUME_HEADER_SIZE].copy_from_slice(&encoded);

        let mut bitmap = vec![0_u8; at(bitmap_blocks)];
        mark_used(&mut bitmap, 0, reserved + bitmap_blocks);
        mark_used(&mut bitmap, extents_start, extents_blocks + catalog_blocks);
        mark_used(&mut bitmap, total - tail, tail);
        for file in &files {
            for ext in &file.extents {
                mark_used(&mut bitmap, ext.start_block, ext.block_count);
            }
        }
        bytes[at(reserved)..at(reserved) + bitmap.len()].copy_from_slice(&bitmap);
        bytes[at(extents_start)..at(extents_start) + extents_tree.len()]
            .copy_from_slice(&extents_tree);
        bytes[at(catalog_start)..at(catalog_start) + catalog_tree.len()]
            .copy_from_slice(&catalog_tree);

        for file in &files {
            let mut remaining = file.data;
            for ext in &file.extents {
                let len = remaining.len().min(at(ext.block_count));
                let dst = at(ext.start_block);
                bytes[dst..dst + len].copy_from_slice(&remaining[..len]);
                remaining = &remaining[len..];
            }
        }

        debug!(
            total_blocks = total,
            files = files.len(),
            folders = folders.len(),
            "built hfs+ image"
        );
        return Ok(HfsImage {
            bytes,
            header,
            catalog_node_size: options.catalog_node_size,
        });
    }
}

fn allocate(file: &mut PlannedFile<'_>, cursor: &mut u32, block_size: u32, fragment: bool) -> Result<u32> {
    let blocks = u32::try_from(file.data.len().div_ceil(block_size as usize))
        .with_context(|| format!("{} is too large", file.name))?;
    file.extents.clear();
    if blocks == 0 {
        return Ok(0);
    }
    if fragment {
        for i in 0..blocks {
            file.extents.push(HfsPlusExtentDescriptor {
                start_block: *cursor,
                block_count: 1,
            });
            *cursor += if i + 1 < blocks { 2 } else { 1 };
        }
    } else {
        file.extents.push(HfsPlusExtentDescriptor {
            start_block: *cursor,
            block_count: blocks,
        });
        *cursor += blocks;
    }
    Ok(blocks)
}

fn contiguous_fork(start: u32, blocks: u32, block_size: u32) -> HfsPlusForkData {
    let mut fork = HfsPlusForkData {
        logical_size: u64::from(blocks) * u64::from(block_size),
        clump_size: block_size,
        total_blocks: blocks,
        ..HfsPlusForkData::default()
    };
    fork.extents[0] = HfsPlusExtentDescriptor {
        start_block: start,
        block_count: blocks,
    };
    fork
}

/// Set allocation bits, most significant bit first.
fn mark_used(bitmap: &mut [u8], start: u32, count: u32) {
    for block in start..start + count {
        let block = block as usize;
        bitmap[block / 8] |= 0x80 >> (block % 8);
    }
}

fn extents_records(files: &[PlannedFile<'_>]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut records = Vec::new();
    for file in files {
        let Some(overflow) = file.extents.get(EXTENT_RECORD_LEN..) else {
            continue;
        };
        let mut start_block: u32 = file.extents[..EXTENT_RECORD_LEN]
            .iter()
            .map(|ext| ext.block_count)
            .sum();
        for chunk in overflow.chunks(EXTENT_RECORD_LEN) {
            let key = ExtentKey {
                file_id: file.id,
                fork_type: ForkType::Data,
                start_block,
            };
            let mut descriptors = [HfsPlusExtentDescriptor::default(); EXTENT_RECORD_LEN];
            descriptors[..chunk.len()].copy_from_slice(chunk);
            let mut data = vec![0_u8; EXTENT_RECORD_LEN * EXTENT_DESCRIPTOR_SIZE];
            write_extent_record(&mut data, 0, &descriptors)?;
            records.push((key, data));
            start_block += chunk.iter().map(|ext| ext.block_count).sum::<u32>();
        }
    }
    records.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(records
        .into_iter()
        .map(|(key, data)| (key.encode().to_vec(), data))
        .collect())
}

fn catalog_records(
    label: &str,
    folders: &[PlannedFolder],
    files: &[PlannedFile<'_>],
    mode: KeyCompare,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let t = unix_to_hfs_time(FIXTURE_TIME);
    let dates = CatalogDates {
        create: t,
        content_modify: t,
        attribute_modify: t,
        access: t,
        backup: 0,
    };
    let root = CatalogNodeId::ROOT_FOLDER;
    let root_valence = folders.iter().filter(|f| f.parent == root).count()
        + files.iter().filter(|f| f.parent == root).count();

    let mut records = vec![
        (
            CatalogKey::new(root, ""),
            CatalogRecord::FolderThread(CatalogThread {
                parent_id: CatalogNodeId::ROOT_PARENT,
                name: label.encode_utf16().collect(),
            }),
        ),
        (
            CatalogKey::new(CatalogNodeId::ROOT_PARENT, label),
            CatalogRecord::Folder(CatalogFolder {
                flags: 0,
                valence: u32::try_from(root_valence)?,
                folder_id: root,
                dates,
            }),
        ),
    ];
    for folder in folders {
        records.push((
            CatalogKey::new(folder.parent, &folder.name),
            CatalogRecord::Folder(CatalogFolder {
                flags: 0,
                valence: folder.valence,
                folder_id: folder.id,
                dates,
            }),
        ));
        records.push((
            CatalogKey::new(folder.id, ""),
            CatalogRecord::FolderThread(CatalogThread {
                parent_id: folder.parent,
                name: folder.name.encode_utf16().collect(),
            }),
        ));
    }
    for file in files {
        records.push((
            CatalogKey::new(file.parent, &file.name),
            CatalogRecord::File(CatalogFile {
                flags: 0,
                file_id: file.id,
                dates,
                data_fork: HfsPlusForkData {
                    logical_size: file.data.len() as u64,
                    clump_size: 0,
                    total_blocks: file.blocks(),
                    extents: file.inline_extents(),
                },
                resource_fork: HfsPlusForkData::default(),
            }),
        ));
        records.push((
            CatalogKey::new(file.id, ""),
            CatalogRecord::FileThread(CatalogThread {
                parent_id: file.parent,
                name: file.name.encode_utf16().collect(),
            }),
        ));
    }

    records.sort_by(|a, b| a.0.compare(&b.0, mode));
    if let Some(pair) = records
        .windows(2)
        .find(|pair| pair[0].0.compare(&pair[1].0, mode) == Ordering::Equal)
    {
        bail!("duplicate name {:?} in one folder", pair[1].0.name_string());
    }
    records
        .iter()
        .map(|(key, record)| Ok((key.encode()?, record.encode()?)))
        .collect()
}

struct TreeParams {
    node_size: u16,
    block_size: u32,
    max_key_length: u16,
    key_compare_type: u8,
    attributes: u32,
}

/// Serialize a whole B-tree file: header node, leaves left to right, then
/// each index level up to the root. Returns the file padded to whole
/// allocation blocks.
fn build_tree(params: &TreeParams, records: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Vec<u8>> {
    let node_size = usize::from(params.node_size);
    let leaf_records = u32::try_from(records.len())?;
    let items = records
        .into_iter()
        .map(|(key, data)| {
            let mut record = key.clone();
            if record.len() % 2 == 1 {
                record.push(0);
            }
            record.extend_from_slice(&data);
            (key, record)
        })
        .collect();

    let mut nodes: Vec<Vec<u8>> = vec![Vec::new()];
    let leaves = pack(items, node_size)?;
    let leaf_count = u32::try_from(leaves.len())?;
    let mut level = emit_level(&mut nodes, leaves, NodeKind::Leaf, 1, node_size)?;
    let mut height = 1_u8;
    while level.len() > 1 {
        height = height.checked_add(1).context("tree too deep")?;
        let items = level
            .into_iter()
            .map(|(key, child)| {
                let mut record = key.clone();
                if params.attributes & BT_VARIABLE_INDEX_KEYS_MASK == 0 {
                    record.resize(2 + usize::from(params.max_key_length), 0);
                }
                record.extend_from_slice(&child.to_be_bytes());
                (key, record)
            })
            .collect();
        level = emit_level(&mut nodes, pack(items, node_size)?, NodeKind::Index, height, node_size)?;
    }
    let root_node = level.first().map_or(0, |(_, node)| *node);

    let block_size = params.block_size as usize;
    let file_len = (nodes.len() * node_size).div_ceil(block_size) * block_size;
    let total_nodes = file_len / node_size;
    let map_len =
        node_size - NODE_DESCRIPTOR_SIZE - HEADER_RECORD_SIZE - USER_DATA_RECORD_SIZE - 8;
    ensure!(
        total_nodes <= map_len * 8,
        "{total_nodes} nodes need map nodes, which are not built"
    );
    let mut map = vec![0_u8; map_len];
    for node in 0..nodes.len() {
        map[node / 8] |= 0x80 >> (node % 8);
    }
    let header = BTreeHeaderRecord {
        tree_depth: if root_node == 0 { 0 } else { u16::from(height) },
        root_node,
        leaf_records,
        first_leaf_node: u32::from(leaf_count > 0),
        last_leaf_node: leaf_count,
        node_size: params.node_size,
        max_key_length: params.max_key_length,
        total_nodes: u32::try_from(total_nodes)?,
        free_nodes: u32::try_from(total_nodes - nodes.len())?,
        clump_size: u32::try_from(file_len)?,
        btree_type: 0,
        key_compare_type: params.key_compare_type,
        attributes: params.attributes,
    };
    let descriptor = NodeDescriptor {
        forward_link: 0,
        backward_link: 0,
        kind: NodeKind::Header,
        height: 0,
        num_records: 0,
    };
    nodes[0] = encode_node(
        node_size,
        &descriptor,
        &[header.to_bytes()?, vec![0; USER_DATA_RECORD_SIZE], map],
    )?;

    let mut out = nodes.concat();
    out.resize(file_len, 0);
    Ok(out)
}

type KeyedRecord = (Vec<u8>, Vec<u8>);

/// Greedy left-to-right packing of `(first key, record bytes)` pairs.
fn pack(items: Vec<KeyedRecord>, node_size: usize) -> Result<Vec<Vec<KeyedRecord>>> {
    let empty = NODE_DESCRIPTOR_SIZE + 2;
    let mut groups = Vec::new();
    let mut current = Vec::new();
    let mut used = empty;
    for item in items {
        let need = item.1.len() + 2;
        ensure!(
            empty + need <= node_size,
            "record of {} bytes does not fit a {node_size}-byte node",
            item.1.len()
        );
        if used + need > node_size {
            groups.push(std::mem::take(&mut current));
            used = empty;
        }
        used += need;
        current.push(item);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    Ok(groups)
}

/// Append one level of sibling-linked nodes and return each node's first
/// key and number.
fn emit_level(
    nodes: &mut Vec<Vec<u8>>,
    groups: Vec<Vec<KeyedRecord>>,
    kind: NodeKind,
    height: u8,
    node_size: usize,
) -> Result<Vec<(Vec<u8>, u32)>> {
    let base = u32::try_from(nodes.len())?;
    let count = u32::try_from(groups.len())?;
    let mut out = Vec::with_capacity(groups.len());
    for (i, group) in (0_u32..).zip(groups) {
        let number = base + i;
        let descriptor = NodeDescriptor {
            forward_link: if i + 1 < count { number + 1 } else { 0 },
            backward_link: if i > 0 { number - 1 } else { 0 },
            kind,
            height,
            num_records: 0,
        };
        let first_key = group[0].0.clone();
        let records: Vec<Vec<u8>> = group.into_iter().map(|(_, record)| record).collect();
        nodes.push(encode_node(node_size, &descriptor, &records)?);
        out.push((first_key, number));
    }
    Ok(out)
}
