//! HFS+ / HFSX volumes.
//!
//! The catalog and extents overflow files are B-trees stored in forks of
//! the volume. Both are opened through [`BTree`] with a format built from
//! the node descriptor layout plus a per-tree record codec.

use crate::entry::{DecodedEntry, DecodedSlot, EntryError, EntryMeta, NameRule, VolumeReader};
use crate::fs::{FileSystem, TreeFileSystem};
use crate::parse_to_pfs_error;
use crate::registry::{FileSystemType, MountOptions};
use parking_lot::Mutex;
use pfs_block::{BlockDevice, read_bytes};
use pfs_btree::{BTree, BTreeHeader, CachedNodeSource, NodeSource, TreeFormat};
use pfs_error::{PfsError, Result};
use pfs_extent::{DataExtent, ExtentMap, ExtentReader, SparsePolicy};
use pfs_ondisk::hfsplus::{
    BTreeHeaderRecord, CatalogFile, CatalogFolder, CatalogKey, CatalogRecord, ExtentKey,
    EXTENT_RECORD_LEN, ForkType, HfsPlusExtentDescriptor, HfsPlusForkData, HfsPlusVolumeHeader,
    KeyCompare, NodeDescriptor, NodeKind, VOLUME_HEADER_OFFSET, VOLUME_HEADER_SIZE,
    hfs_time_to_unix, node_record, parse_extent_record, split_keyed_record,
};
use pfs_types::{CatalogNodeId, ParseError, read_be_u32};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Smallest legal B-tree node; enough to read any header record.
const MIN_NODE_SIZE: usize = 512;

/// Data fork maps kept per mounted volume before the cache is reset.
const FORK_MAP_CACHE_ENTRIES: usize = 256;

/// Registry entry for HFS+ and HFSX.
#[derive(Debug, Clone, Copy, Default)]
pub struct HfsPlusType;

impl FileSystemType for HfsPlusType {
    fn name(&self) -> &'static str {
        "hfsplus"
    }

    fn probe_len(&self) -> usize {
        VOLUME_HEADER_OFFSET + VOLUME_HEADER_SIZE
    }

    fn supports(&self, probe: &[u8], _device: &dyn BlockDevice) -> bool {
        probe
            .get(VOLUME_HEADER_OFFSET..VOLUME_HEADER_OFFSET + VOLUME_HEADER_SIZE)
            .is_some_and(|region| HfsPlusVolumeHeader::parse_region(region).is_ok())
    }

    fn create(
        &self,
        device: Arc<dyn BlockDevice>,
        options: &MountOptions,
    ) -> Result<Box<dyn FileSystem>> {
        let reader = HfsPlusReader::open(Arc::clone(&device), options)?;
        Ok(Box::new(TreeFileSystem::new(device, reader, options.read_only)?))
    }
}

// ── Tree formats ────────────────────────────────────────────────────────────

/// Decodes the key and data halves of one HFS+ B-tree's records.
pub trait RecordCodec: Send + Sync {
    type Key;
    type Value;

    fn key(&self, key: &[u8]) -> std::result::Result<Self::Key, ParseError>;

    fn value(&self, data: &[u8]) -> std::result::Result<Self::Value, ParseError>;

    fn compare(&self, a: &Self::Key, b: &Self::Key) -> Ordering;
}

/// Catalog records. A record body that fails to decode is kept as the
/// value so the listing can report it per slot; a bad key is fatal.
#[derive(Debug, Clone, Copy)]
pub struct CatalogCodec {
    pub key_compare: KeyCompare,
}

impl RecordCodec for CatalogCodec {
    type Key = CatalogKey;
    type Value = std::result::Result<CatalogRecord, ParseError>;

    fn key(&self, key: &[u8]) -> std::result::Result<CatalogKey, ParseError> {
        CatalogKey::parse(key, 0)
    }

    fn value(&self, data: &[u8]) -> std::result::Result<Self::Value, ParseError> {
        Ok(CatalogRecord::parse(data))
    }

    fn compare(&self, a: &CatalogKey, b: &CatalogKey) -> Ordering {
        a.compare(b, self.key_compare)
    }
}

/// Extents overflow records: eight extent descriptors per key.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtentsCodec;

impl RecordCodec for ExtentsCodec {
    type Key = ExtentKey;
    type Value = [HfsPlusExtentDescriptor; EXTENT_RECORD_LEN];

    fn key(&self, key: &[u8]) -> std::result::Result<ExtentKey, ParseError> {
        ExtentKey::parse(key, 0)
    }

    fn value(&self, data: &[u8]) -> std::result::Result<Self::Value, ParseError> {
        parse_extent_record(data, 0)
    }

    fn compare(&self, a: &ExtentKey, b: &ExtentKey) -> Ordering {
        a.cmp(b)
    }
}

/// [`TreeFormat`] for HFS+ B-tree nodes.
///
/// Leaves have height 1 and index nodes height > 1. Index keys occupy
/// `max_key_length` bytes unless the tree uses variable-length index keys.
pub struct HfsTreeFormat<C> {
    codec: C,
    fixed_index_key: Option<u16>,
}

impl<C: fmt::Debug> fmt::Debug for HfsTreeFormat<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HfsTreeFormat")
            .field("codec", &self.codec)
            .field("fixed_index_key", &self.fixed_index_key)
            .finish()
    }
}

impl<C: RecordCodec> HfsTreeFormat<C> {
    #[must_use]
    pub fn new(codec: C, header: &BTreeHeaderRecord) -> Self {
        Self {
            codec,
            fixed_index_key: (!header.has_variable_index_keys()).then_some(header.max_key_length),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }
}

fn link(raw: u32) -> Option<u64> {
    (raw != 0).then_some(u64::from(raw))
}

impl<C: RecordCodec> TreeFormat for HfsTreeFormat<C> {
    type Key = C::Key;
    type Value = C::Value;

    fn parse_header(&self, node: &[u8]) -> std::result::Result<BTreeHeader, ParseError> {
        let desc = NodeDescriptor::parse(node)?;
        let level = match desc.kind {
            NodeKind::Leaf if desc.height == 1 => 0,
            NodeKind::Leaf => {
                return Err(ParseError::InvalidField {
                    field: "height",
                    reason: "leaf node height must be 1",
                });
            }
            NodeKind::Index if desc.height > 1 => u16::from(desc.height - 1),
            NodeKind::Index => {
                return Err(ParseError::InvalidField {
                    field: "height",
                    reason: "index node height must exceed 1",
                });
            }
            NodeKind::Header | NodeKind::Map => {
                return Err(ParseError::InvalidField {
                    field: "node_kind",
                    reason: "expected a leaf or index node",
                });
            }
        };
        Ok(BTreeHeader {
            level,
            record_count: desc.num_records,
            left_sibling: link(desc.backward_link),
            right_sibling: link(desc.forward_link),
        })
    }

    fn leaf_record(
        &self,
        node: &[u8],
        header: &BTreeHeader,
        index: usize,
    ) -> std::result::Result<(C::Key, C::Value), ParseError> {
        let record = node_record(node, header.record_count, index)?;
        let (key, data) = split_keyed_record(record, None)?;
        Ok((self.codec.key(key)?, self.codec.value(data)?))
    }

    fn index_record(
        &self,
        node: &[u8],
        header: &BTreeHeader,
        index: usize,
    ) -> std::result::Result<(C::Key, u64), ParseError> {
        let record = node_record(node, header.record_count, index)?;
        let (key, data) = split_keyed_record(record, self.fixed_index_key)?;
        Ok((self.codec.key(key)?, u64::from(read_be_u32(data, 0)?)))
    }

    fn compare(&self, a: &C::Key, b: &C::Key) -> Ordering {
        self.codec.compare(a, b)
    }
}

// ── Fork-backed node source ─────────────────────────────────────────────────

/// B-tree nodes read through the extents of a special file's fork.
pub struct ForkNodeSource {
    device: Arc<dyn BlockDevice>,
    map: ExtentMap,
    length: u64,
    node_size: usize,
}

impl fmt::Debug for ForkNodeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkNodeSource")
            .field("length", &self.length)
            .field("node_size", &self.node_size)
            .finish_non_exhaustive()
    }
}

impl ForkNodeSource {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        ExtentReader::new(self.device.as_ref(), &self.map, self.length).read(offset, len)
    }
}

impl NodeSource for ForkNodeSource {
    fn read_node(&self, node: u64) -> Result<Arc<[u8]>> {
        let offset = node
            .checked_mul(self.node_size as u64)
            .filter(|offset| *offset < self.length)
            .ok_or_else(|| {
                PfsError::corruption(node, format!("node beyond tree file of {} bytes", self.length))
            })?;
        let bytes = self.read_at(offset, self.node_size)?;
        if bytes.len() != self.node_size {
            return Err(PfsError::corruption(node, "tree file ends inside node"));
        }
        trace!(node, "hfsplus: read node");
        Ok(Arc::from(bytes))
    }

    fn node_count(&self) -> u64 {
        self.length / self.node_size as u64
    }
}

type HfsTree<C> = BTree<HfsTreeFormat<C>, CachedNodeSource<ForkNodeSource>>;
type CatalogTree = HfsTree<CatalogCodec>;
type ExtentsTree = HfsTree<ExtentsCodec>;

/// Open the B-tree stored in `map`. The header node supplies node size,
/// root and key layout.
fn open_tree<C, F>(
    device: &Arc<dyn BlockDevice>,
    map: ExtentMap,
    length: u64,
    options: &MountOptions,
    codec: F,
) -> Result<HfsTree<C>>
where
    C: RecordCodec,
    F: FnOnce(&BTreeHeaderRecord) -> C,
{
    let mut source = ForkNodeSource {
        device: Arc::clone(device),
        map,
        length,
        node_size: MIN_NODE_SIZE,
    };
    let head = source.read_at(0, MIN_NODE_SIZE)?;
    let header = BTreeHeaderRecord::parse_from_node(&head).map_err(|e| parse_to_pfs_error(0, &e))?;
    source.node_size = usize::from(header.node_size);
    debug!(
        node_size = header.node_size,
        root = header.root_node,
        depth = header.tree_depth,
        "hfsplus: opened tree"
    );
    let format = HfsTreeFormat::new(codec(&header), &header);
    let source = CachedNodeSource::new(source, options.node_cache_capacity)?;
    Ok(BTree::new(format, source, link(header.root_node)))
}

fn push_extent(
    extents: &mut Vec<DataExtent>,
    mapped: &mut u64,
    desc: &HfsPlusExtentDescriptor,
    block_size: u32,
) {
    extents.push(DataExtent::new(
        *mapped * u64::from(block_size),
        u64::from(desc.start_block),
        u64::from(desc.block_count),
    ));
    *mapped += u64::from(desc.block_count);
}

/// Extent map of a fork, pulling descriptors past the inline eight from
/// the extents overflow tree.
fn fork_map(
    block_size: u32,
    file_id: CatalogNodeId,
    fork_type: ForkType,
    fork: &HfsPlusForkData,
    overflow: Option<&ExtentsTree>,
) -> Result<ExtentMap> {
    let mut extents = Vec::new();
    let mut mapped = 0_u64;
    for desc in fork.extents.iter().take_while(|d| !d.is_empty()) {
        push_extent(&mut extents, &mut mapped, desc, block_size);
    }

    let total = u64::from(fork.total_blocks);
    let first_block = u64::from(fork.extents[0].start_block);
    if mapped < total {
        let tree = overflow.ok_or_else(|| {
            PfsError::corruption(first_block, format!("fork of file {} needs overflow extents", file_id.0))
        })?;
        let start = u32::try_from(mapped)
            .map_err(|_| PfsError::corruption(first_block, "fork block count exceeds 32 bits"))?;
        let mut gap = None;
        tree.scan_from(
            &ExtentKey {
                file_id,
                fork_type,
                start_block: start,
            },
            |key, record| {
                if key.file_id != file_id || key.fork_type != fork_type {
                    return ControlFlow::Break(());
                }
                if u64::from(key.start_block) != mapped {
                    gap = Some(key.start_block);
                    return ControlFlow::Break(());
                }
                for desc in record.iter().take_while(|d| !d.is_empty()) {
                    push_extent(&mut extents, &mut mapped, desc, block_size);
                }
                if mapped >= total {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        )?;
        if let Some(found) = gap {
            return Err(PfsError::corruption(
                first_block,
                format!("overflow extents of file {} resume at block {found}, expected {mapped}", file_id.0),
            ));
        }
    }
    if mapped != total {
        return Err(PfsError::corruption(
            first_block,
            format!("fork of file {} maps {mapped} of {total} blocks", file_id.0),
        ));
    }
    if fork.logical_size > mapped * u64::from(block_size) {
        return Err(PfsError::corruption(
            first_block,
            format!("fork of file {} is longer than its extents", file_id.0),
        ));
    }
    ExtentMap::new(block_size, extents, SparsePolicy::Deny)
}

// ── Reader ──────────────────────────────────────────────────────────────────

/// Where an HFS+ entry's data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HfsLocator {
    Folder(CatalogNodeId),
    File {
        id: CatalogNodeId,
        fork: HfsPlusForkData,
    },
}

fn hfs_time(raw: u32) -> Option<i64> {
    (raw != 0).then(|| hfs_time_to_unix(raw))
}

fn folder_entry(name: String, folder: &CatalogFolder) -> DecodedEntry<HfsLocator> {
    let mut meta = EntryMeta::directory(name);
    meta.node_id = Some(u64::from(folder.folder_id.0));
    meta.created = hfs_time(folder.dates.create);
    meta.modified = hfs_time(folder.dates.content_modify);
    meta.accessed = hfs_time(folder.dates.access);
    DecodedEntry {
        meta,
        locator: HfsLocator::Folder(folder.folder_id),
    }
}

fn file_entry(name: String, file: &CatalogFile) -> DecodedEntry<HfsLocator> {
    let mut meta = EntryMeta::file(name, file.data_fork.logical_size);
    meta.node_id = Some(u64::from(file.file_id.0));
    meta.created = hfs_time(file.dates.create);
    meta.modified = hfs_time(file.dates.content_modify);
    meta.accessed = hfs_time(file.dates.access);
    DecodedEntry {
        meta,
        locator: HfsLocator::File {
            id: file.file_id,
            fork: file.data_fork,
        },
    }
}

/// [`VolumeReader`] over a mounted HFS+ volume.
pub struct HfsPlusReader {
    device: Arc<dyn BlockDevice>,
    header: HfsPlusVolumeHeader,
    extents: Option<ExtentsTree>,
    catalog: CatalogTree,
    key_compare: KeyCompare,
    volume_name: String,
    root: CatalogFolder,
    fork_maps: Mutex<HashMap<CatalogNodeId, Arc<ExtentMap>>>,
}

impl fmt::Debug for HfsPlusReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HfsPlusReader")
            .field("volume_name", &self.volume_name)
            .field("block_size", &self.header.block_size)
            .field("key_compare", &self.key_compare)
            .finish_non_exhaustive()
    }
}

impl HfsPlusReader {
    pub fn open(device: Arc<dyn BlockDevice>, options: &MountOptions) -> Result<Self> {
        let mut region = [0_u8; VOLUME_HEADER_SIZE];
        read_bytes(device.as_ref(), VOLUME_HEADER_OFFSET as u64, &mut region)?;
        let header =
            HfsPlusVolumeHeader::parse_region(&region).map_err(|e| parse_to_pfs_error(2, &e))?;
        let block_size = header.block_size;
        if header.total_bytes() > device.len_bytes() {
            error!(
                total = header.total_bytes(),
                device = device.len_bytes(),
                "hfsplus: volume larger than device"
            );
            return Err(PfsError::corruption(
                2,
                format!("volume of {} bytes exceeds device", header.total_bytes()),
            ));
        }

        let extents = if header.extents_file.logical_size == 0 {
            None
        } else {
            let map = fork_map(
                block_size,
                CatalogNodeId::EXTENTS_FILE,
                ForkType::Data,
                &header.extents_file,
                None,
            )?;
            Some(open_tree(
                &device,
                map,
                header.extents_file.logical_size,
                options,
                |_| ExtentsCodec,
            )?)
        };

        let catalog_map = fork_map(
            block_size,
            CatalogNodeId::CATALOG_FILE,
            ForkType::Data,
            &header.catalog_file,
            extents.as_ref(),
        )?;
        let is_hfsx = header.is_hfsx();
        let catalog = open_tree(
            &device,
            catalog_map,
            header.catalog_file.logical_size,
            options,
            |tree| CatalogCodec {
                key_compare: tree.key_compare(is_hfsx),
            },
        )?;
        let key_compare = catalog.format().codec().key_compare;

        let (volume_name, root) = Self::load_root(&catalog)?;
        debug!(volume = %volume_name, hfsx = is_hfsx, ?key_compare, "hfsplus: mounted");
        Ok(Self {
            device,
            header,
            extents,
            catalog,
            key_compare,
            volume_name,
            root,
            fork_maps: Mutex::new(HashMap::new()),
        })
    }

    /// Root folder thread, then the folder record it names.
    fn load_root(catalog: &CatalogTree) -> Result<(String, CatalogFolder)> {
        let at = catalog.root().unwrap_or(0);
        let thread_key = CatalogKey {
            parent_id: CatalogNodeId::ROOT_FOLDER,
            name: Vec::new(),
        };
        let thread = match catalog.lookup(&thread_key)? {
            Some(Ok(CatalogRecord::FolderThread(thread))) => thread,
            Some(Ok(_)) => return Err(PfsError::corruption(at, "root thread is not a folder thread")),
            Some(Err(e)) => return Err(parse_to_pfs_error(at, &e)),
            None => return Err(PfsError::corruption(at, "root folder thread missing")),
        };
        let folder_key = CatalogKey {
            parent_id: thread.parent_id,
            name: thread.name.clone(),
        };
        match catalog.lookup(&folder_key)? {
            Some(Ok(CatalogRecord::Folder(folder))) if folder.folder_id == CatalogNodeId::ROOT_FOLDER => {
                Ok((thread.name_string(), folder))
            }
            Some(Ok(_)) => Err(PfsError::corruption(at, "root record is not folder 2")),
            Some(Err(e)) => Err(parse_to_pfs_error(at, &e)),
            None => Err(PfsError::corruption(at, "root folder record missing")),
        }
    }

    #[must_use]
    pub fn header(&self) -> &HfsPlusVolumeHeader {
        &self.header
    }

    #[must_use]
    pub fn key_compare(&self) -> KeyCompare {
        self.key_compare
    }

    /// Extent map of a file's data fork, built once per file and then
    /// served from the volume's cache.
    pub fn data_fork_map(
        &self,
        id: CatalogNodeId,
        fork: &HfsPlusForkData,
    ) -> Result<Arc<ExtentMap>> {
        if let Some(map) = self.fork_maps.lock().get(&id) {
            return Ok(Arc::clone(map));
        }
        // Built without the lock; overflow lookups read the device.
        let map = Arc::new(fork_map(
            self.header.block_size,
            id,
            ForkType::Data,
            fork,
            self.extents.as_ref(),
        )?);
        let mut maps = self.fork_maps.lock();
        if maps.len() >= FORK_MAP_CACHE_ENTRIES {
            trace!(entries = maps.len(), "hfsplus: fork map cache reset");
            maps.clear();
        }
        Ok(Arc::clone(maps.entry(id).or_insert(map)))
    }
}

impl VolumeReader for HfsPlusReader {
    type Locator = HfsLocator;

    fn type_name(&self) -> &'static str {
        "hfsplus"
    }

    fn volume_name(&self) -> String {
        self.volume_name.clone()
    }

    fn total_space(&self) -> u64 {
        self.header.total_bytes()
    }

    fn free_space(&self) -> Result<u64> {
        Ok(self.header.free_bytes())
    }

    fn name_rule(&self) -> NameRule {
        match self.key_compare {
            KeyCompare::Binary => NameRule::CaseSensitive,
            KeyCompare::CaseFolding => NameRule::CaseInsensitive,
        }
    }

    fn root(&self) -> Result<DecodedEntry<HfsLocator>> {
        Ok(folder_entry(self.volume_name.clone(), &self.root))
    }

    fn children(&self, dir: &HfsLocator) -> Result<Vec<DecodedSlot<HfsLocator>>> {
        let HfsLocator::Folder(cnid) = dir else {
            return Err(PfsError::NotDirectory);
        };
        let cnid = *cnid;
        let mut out = Vec::new();
        let start = CatalogKey {
            parent_id: cnid,
            name: Vec::new(),
        };
        self.catalog.scan_from(&start, |key, record| {
            if key.parent_id != cnid {
                return ControlFlow::Break(());
            }
            let name = key.name_string();
            match record {
                Ok(CatalogRecord::Folder(folder)) => out.push(Ok(folder_entry(name, &folder))),
                Ok(CatalogRecord::File(file)) => out.push(Ok(file_entry(name, &file))),
                Ok(CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_)) => {}
                Err(e) => out.push(Err(EntryError {
                    name,
                    detail: e.to_string(),
                })),
            }
            ControlFlow::Continue(())
        })?;
        trace!(folder = cnid.0, children = out.len(), "hfsplus: listed folder");
        Ok(out)
    }

    fn read(&self, file: &HfsLocator, length: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        let HfsLocator::File { id, fork } = file else {
            return Err(PfsError::IsDirectory);
        };
        let map = self.data_fork_map(*id, fork)?;
        ExtentReader::new(self.device.as_ref(), map.as_ref(), length).read(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_ondisk::hfsplus::encode_node;

    fn leaf(records: &[Vec<u8>], height: u8) -> Vec<u8> {
        let desc = NodeDescriptor {
            forward_link: 0,
            backward_link: 0,
            kind: NodeKind::Leaf,
            height,
            num_records: 0,
        };
        encode_node(512, &desc, records).expect("node")
    }

    fn extents_header(attributes: u32) -> BTreeHeaderRecord {
        BTreeHeaderRecord {
            tree_depth: 1,
            root_node: 1,
            leaf_records: 1,
            first_leaf_node: 1,
            last_leaf_node: 1,
            node_size: 512,
            max_key_length: 10,
            total_nodes: 2,
            free_nodes: 0,
            clump_size: 0,
            btree_type: 0,
            key_compare_type: 0,
            attributes,
        }
    }

    #[test]
    fn node_kinds_map_to_levels() {
        let format = HfsTreeFormat::new(ExtentsCodec, &extents_header(2));
        let header = format.parse_header(&leaf(&[], 1)).expect("leaf");
        assert!(header.is_leaf());
        assert_eq!(header.left_sibling, None);
        assert!(format.parse_header(&leaf(&[], 2)).is_err());

        let index = encode_node(
            512,
            &NodeDescriptor {
                forward_link: 7,
                backward_link: 3,
                kind: NodeKind::Index,
                height: 3,
                num_records: 0,
            },
            &[],
        )
        .expect("index");
        let header = format.parse_header(&index).expect("index");
        assert_eq!(header.level, 2);
        assert_eq!(header.right_sibling, Some(7));
        assert_eq!(header.left_sibling, Some(3));
    }

    #[test]
    fn fixed_length_index_keys_are_padded() {
        let key = ExtentKey {
            file_id: CatalogNodeId(20),
            fork_type: ForkType::Data,
            start_block: 8,
        };
        let mut record = key.encode().to_vec();
        record.extend_from_slice(&9_u32.to_be_bytes());
        let node = encode_node(
            512,
            &NodeDescriptor {
                forward_link: 0,
                backward_link: 0,
                kind: NodeKind::Index,
                height: 2,
                num_records: 0,
            },
            &[record],
        )
        .expect("node");
        let format = HfsTreeFormat::new(ExtentsCodec, &extents_header(2));
        let header = format.parse_header(&node).expect("header");
        let (parsed, child) = format.index_record(&node, &header, 0).expect("record");
        assert_eq!(parsed, key);
        assert_eq!(child, 9);
    }

    #[test]
    fn catalog_record_failure_is_kept_as_value() {
        let key = CatalogKey::new(CatalogNodeId(2), "bad");
        let mut record = key.encode().expect("key");
        if record.len() % 2 == 1 {
            record.push(0);
        }
        record.extend_from_slice(&[0x00, 0x09, 0, 0]);
        let node = leaf(&[record], 1);
        let format = HfsTreeFormat {
            codec: CatalogCodec {
                key_compare: KeyCompare::CaseFolding,
            },
            fixed_index_key: None,
        };
        let header = format.parse_header(&node).expect("header");
        let (parsed, value) = format.leaf_record(&node, &header, 0).expect("record");
        assert_eq!(parsed.name_string(), "bad");
        assert!(value.is_err());
    }

    #[test]
    fn inline_fork_maps_without_overflow() {
        let mut fork = HfsPlusForkData {
            logical_size: 5000,
            total_blocks: 3,
            ..HfsPlusForkData::default()
        };
        fork.extents[0] = HfsPlusExtentDescriptor {
            start_block: 10,
            block_count: 2,
        };
        fork.extents[1] = HfsPlusExtentDescriptor {
            start_block: 40,
            block_count: 1,
        };
        let map = fork_map(2048, CatalogNodeId(30), ForkType::Data, &fork, None).expect("map");
        assert_eq!(map.extents().len(), 2);
        assert_eq!(map.extents()[1].logical_offset, 4096);
        assert_eq!(map.policy(), SparsePolicy::Deny);
    }

    #[test]
    fn incomplete_fork_is_corruption() {
        let mut fork = HfsPlusForkData {
            logical_size: 4096,
            total_blocks: 4,
            ..HfsPlusForkData::default()
        };
        fork.extents[0] = HfsPlusExtentDescriptor {
            start_block: 10,
            block_count: 2,
        };
        let err = fork_map(2048, CatalogNodeId(30), ForkType::Data, &fork, None).unwrap_err();
        assert!(matches!(err, PfsError::Corruption { block: 10, .. }));

        fork.total_blocks = 2;
        fork.logical_size = 4097;
        assert!(fork_map(2048, CatalogNodeId(30), ForkType::Data, &fork, None).is_err());
    }

    #[test]
    fn supports_checks_signature_at_1024() {
        let device = pfs_block::SectorBlockDevice::from_bytes(Vec::new()).expect("device");
        let mut probe = vec![0_u8; 1536];
        assert!(!HfsPlusType.supports(&probe, &device));
        let header = HfsPlusVolumeHeader {
            signature: pfs_ondisk::hfsplus::HFSPLUS_SIGNATURE,
            version: pfs_ondisk::hfsplus::HFSPLUS_VERSION,
            attributes: 0,
            last_mounted_version: 0,
            journal_info_block: 0,
            create_date: 0,
            modify_date: 0,
            backup_date: 0,
            checked_date: 0,
            file_count: 0,
            folder_count: 0,
            block_size: 4096,
            total_blocks: 16,
            free_blocks: 4,
            next_allocation: 0,
            rsrc_clump_size: 0,
            data_clump_size: 0,
            next_catalog_id: 16,
            write_count: 0,
            encodings_bitmap: 0,
            finder_info: [0; 8],
            allocation_file: HfsPlusForkData::default(),
            extents_file: HfsPlusForkData::default(),
            catalog_file: HfsPlusForkData::default(),
            attributes_file: HfsPlusForkData::default(),
            startup_file: HfsPlusForkData::default(),
        };
        probe[1024..].copy_from_slice(&header.to_bytes().expect("encode"));
        assert!(HfsPlusType.supports(&probe, &device));
        assert!(!HfsPlusType.supports(&probe[..1200], &device));
    }
}
