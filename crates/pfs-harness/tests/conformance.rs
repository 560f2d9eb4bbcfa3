#![forbid(unsafe_code)]

use pfs::{
    FileSystem, HfsLocator, HfsPlusReader, MemoryByteDevice, MountOptions, NameRule, PfsError,
    SectorBlockDevice, VolumeInfo, VolumeReader,
};
use pfs_harness::{
    FIXTURE_TIME, TreeNode,
    disk::{Part, gpt_disk, mbr_disk},
    fat_image::{FatImageOptions, build_fat},
    hfs_image::{HfsImageOptions, build_hfsplus},
    sample_tree, scan_bytes, scan_path, structure_listing, tree_listing,
};
use pfs_ondisk::FatType;
use pfs_ondisk::hfsplus::{NodeDescriptor, NodeKind};
use pfs_partition::gpt::type_guids;
use std::io::Write as _;
use std::sync::Arc;

fn digest(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

fn listed_names(listing: &str) -> Vec<&str> {
    listing
        .lines()
        .map(|line| line.split(';').next().unwrap_or(line))
        .collect()
}

fn expected_sample_listing() -> String {
    format!(
        "dir1/\n  test.txt; 18; {}\ndir2/\n  test.txt; 18; {}\ntest.txt; 18; {}\n",
        digest(b"dir1 test content\n"),
        digest(b"dir2 test content\n"),
        digest(b"root test content\n"),
    )
}

fn sample_images() -> Vec<(&'static str, Vec<u8>)> {
    let tree = sample_tree();
    let small_hfs = HfsImageOptions {
        block_size: 512,
        catalog_node_size: 512,
        ..HfsImageOptions::default()
    };
    let hfsx = HfsImageOptions {
        case_sensitive: true,
        ..HfsImageOptions::default()
    };
    vec![
        (
            "hfsplus",
            build_hfsplus(&tree, &HfsImageOptions::default()).expect("hfs+").bytes,
        ),
        ("hfsplus-512", build_hfsplus(&tree, &small_hfs).expect("hfs+ 512").bytes),
        ("hfsx", build_hfsplus(&tree, &hfsx).expect("hfsx").bytes),
        (
            "fat12",
            build_fat(&tree, &FatImageOptions::with_type(FatType::Fat12)).expect("fat12"),
        ),
        (
            "fat16",
            build_fat(&tree, &FatImageOptions::with_type(FatType::Fat16)).expect("fat16"),
        ),
    ]
}

fn only_filesystem(image: Vec<u8>) -> Box<dyn FileSystem> {
    let mut volumes = scan_bytes(image).expect("scan");
    assert_eq!(volumes.len(), 1);
    volumes.remove(0).filesystem.expect("mounted")
}

#[test]
fn sample_tree_lists_identically_on_every_format() {
    let expected = expected_sample_listing();
    for (kind, image) in sample_images() {
        let fs = only_filesystem(image);
        assert_eq!(fs.volume_name(), "TESTVOL", "{kind}");
        assert!(fs.is_read_only(), "{kind}");
        assert_eq!(tree_listing(fs.as_ref()).expect("listing"), expected, "{kind}");
    }
}

#[test]
fn sample_tree_lists_identically_inside_partition_tables() {
    let expected = expected_sample_listing();
    let tree = sample_tree();
    let hfs = build_hfsplus(&tree, &HfsImageOptions::default()).expect("hfs+").bytes;
    let fat = build_fat(&tree, &FatImageOptions::default()).expect("fat");

    let mbr = mbr_disk(&[Part::new(0xAF, &hfs), Part::new(0x01, &fat)], &[]).expect("mbr");
    let gpt = gpt_disk(&[
        (Part::new(type_guids::APPLE_HFS, &hfs), "Macintosh HD"),
        (Part::new(type_guids::MS_BASIC_DATA, &fat), "DATA"),
    ])
    .expect("gpt");

    for (kind, disk) in [("mbr", mbr), ("gpt", gpt)] {
        let volumes = scan_bytes(disk).expect("scan");
        let types: Vec<&str> = volumes
            .iter()
            .map(|v| v.filesystem.as_ref().expect("mounted").type_name())
            .collect();
        assert_eq!(types, ["hfsplus", "fat"], "{kind}");
        for volume in &volumes {
            let fs = volume.filesystem.as_ref().expect("mounted");
            assert_eq!(tree_listing(fs.as_ref()).expect("listing"), expected, "{kind}");
        }
    }
}

#[test]
fn fat32_volume_lists_sample_tree() {
    let image = build_fat(&sample_tree(), &FatImageOptions::with_type(FatType::Fat32))
        .expect("fat32");
    let fs = only_filesystem(image);
    assert_eq!(fs.type_name(), "fat");
    assert_eq!(
        tree_listing(fs.as_ref()).expect("listing"),
        expected_sample_listing()
    );
}

#[test]
fn extended_partitions_and_unknown_volumes_are_reported() {
    let tree = sample_tree();
    let hfs = build_hfsplus(&tree, &HfsImageOptions::default()).expect("hfs+").bytes;
    let fat16 = build_fat(&tree, &FatImageOptions::with_type(FatType::Fat16)).expect("fat16");
    let blank = vec![0_u8; 64 * 512];
    let disk = mbr_disk(
        &[Part::new(0xAF, &hfs)],
        &[Part::new(0x06, &fat16), Part::new(0x83, &blank)],
    )
    .expect("disk");

    let volumes = scan_bytes(disk).expect("scan");
    assert_eq!(volumes.len(), 3);
    let infos: Vec<VolumeInfo> = volumes.iter().map(|v| v.info()).collect();
    assert_eq!(infos[0].filesystem.as_deref(), Some("hfsplus"));
    assert_eq!(infos[1].filesystem.as_deref(), Some("fat"));
    assert!(infos[1].partition_type.as_deref().is_some_and(|t| t.starts_with("0x06")));
    assert_eq!(infos[2].filesystem, None);
    assert!(
        infos[2]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("unsupported format"))
    );
    assert!(matches!(
        volumes[2].filesystem,
        Err(PfsError::UnsupportedFormat(_))
    ));

    let json = serde_json::to_string(&infos).expect("json");
    let back: Vec<VolumeInfo> = serde_json::from_str(&json).expect("parse");
    assert_eq!(back, infos);
}

#[test]
fn name_rules_follow_the_volume_format() {
    for (kind, image) in sample_images() {
        let fs = only_filesystem(image);
        let upper = fs.resolve_path("/DIR1/TEST.TXT");
        if kind == "hfsx" {
            assert_eq!(fs.name_rule(), NameRule::CaseSensitive);
            assert!(matches!(upper, Err(PfsError::NotFound(_))), "{kind}");
        } else {
            assert_eq!(fs.name_rule(), NameRule::CaseInsensitive);
            let entry = upper.expect(kind);
            assert_eq!(entry.name(), "test.txt", "{kind}");
        }
        let exact = fs.resolve_path("/dir2/test.txt").expect(kind);
        assert_eq!(
            fs.file(&exact).expect("file").read_to_end().expect("read"),
            b"dir2 test content\n",
            "{kind}"
        );
        assert_eq!(exact.modified(), Some(FIXTURE_TIME), "{kind}");
        assert!(matches!(
            fs.resolve_path("/dir1/missing"),
            Err(PfsError::NotFound(_))
        ));
    }
}

#[test]
fn long_names_and_deep_trees_survive_on_fat_and_hfs() {
    let tree = vec![
        TreeNode::dir(
            "Projects",
            vec![
                TreeNode::dir(
                    "A directory with a long name",
                    vec![TreeNode::file("Notes for the meeting.txt", vec![b'n'; 1500])],
                ),
                TreeNode::file("README", *b"readme"),
                TreeNode::file("empty.dat", Vec::new()),
            ],
        ),
        TreeNode::file("Mixed.Case", *b"mixed"),
    ];
    let hfs = build_hfsplus(&tree, &HfsImageOptions::default()).expect("hfs+").bytes;
    let fat = build_fat(&tree, &FatImageOptions::default()).expect("fat");

    let notes = digest(&[b'n'; 1500]);
    let (readme, empty, mixed) = (digest(b"readme"), digest(b""), digest(b"mixed"));
    // HFS+ lists in catalog key order; FAT in directory slot order.
    let hfs_expected = format!(
        "Mixed.Case; 5; {mixed}\nProjects/\n  A directory with a long name/\n    \
         Notes for the meeting.txt; 1500; {notes}\n  empty.dat; 0; {empty}\n  \
         README; 6; {readme}\n"
    );
    let fat_expected = format!(
        "Projects/\n  A directory with a long name/\n    \
         Notes for the meeting.txt; 1500; {notes}\n  README; 6; {readme}\n  \
         empty.dat; 0; {empty}\nMixed.Case; 5; {mixed}\n"
    );
    assert_eq!(
        tree_listing(only_filesystem(hfs).as_ref()).expect("hfs listing"),
        hfs_expected
    );
    assert_eq!(
        tree_listing(only_filesystem(fat).as_ref()).expect("fat listing"),
        fat_expected
    );
}

#[test]
fn listings_keep_the_volume_order_of_siblings() {
    let tree: Vec<TreeNode> = ["zeta.txt", "B.txt", "a.txt"]
        .iter()
        .map(|name| TreeNode::file(name, *b"x"))
        .collect();
    let hfsx = HfsImageOptions {
        case_sensitive: true,
        ..HfsImageOptions::default()
    };
    let cases = [
        (
            "hfsplus",
            build_hfsplus(&tree, &HfsImageOptions::default()).expect("hfs+").bytes,
            ["a.txt", "B.txt", "zeta.txt"],
        ),
        (
            "hfsx",
            build_hfsplus(&tree, &hfsx).expect("hfsx").bytes,
            ["B.txt", "a.txt", "zeta.txt"],
        ),
        (
            "fat",
            build_fat(&tree, &FatImageOptions::default()).expect("fat"),
            ["zeta.txt", "B.txt", "a.txt"],
        ),
    ];
    for (kind, image, expected) in cases {
        let fs = only_filesystem(image);
        let listing = tree_listing(fs.as_ref()).expect("listing");
        assert_eq!(listed_names(&listing), expected, "{kind}");
        let direct: Vec<String> = fs
            .list_entries(&fs.root_entry())
            .expect("list")
            .iter()
            .map(|slot| slot.name().to_owned())
            .collect();
        assert_eq!(direct, expected, "{kind}");
    }
}

#[test]
fn fat_directory_pointing_at_itself_is_listed_once() {
    let mut image =
        build_fat(&sample_tree(), &FatImageOptions::with_type(FatType::Fat16)).expect("fat16");
    // Turn dir1's "." slot into an ordinary subdirectory entry that still
    // names dir1's own cluster.
    let at = image
        .chunks_exact(32)
        .position(|slot| slot[..11] == *b".          " && slot[11] == 0x10)
        .expect("dot entry")
        * 32;
    image[at..at + 11].copy_from_slice(b"LOOP       ");

    let fs = only_filesystem(image);
    let dir1 = fs.resolve_path("/dir1").expect("dir1");
    let looped = fs.resolve_path("/dir1/LOOP").expect("loop");
    assert!(looped.is_directory());
    assert_eq!(looped.node_id(), dir1.node_id());
    assert!(fs.resolve_path("/dir1/LOOP/LOOP/test.txt").is_ok());

    let listing = tree_listing(fs.as_ref()).expect("listing");
    let expected = expected_sample_listing().replacen(
        "dir1/\n",
        "dir1/\n  !LOOP; directory cycle\n",
        1,
    );
    assert_eq!(listing, expected);
}

#[test]
fn hfs_and_fat_entries_carry_distinct_node_ids() {
    for (kind, image) in sample_images() {
        let fs = only_filesystem(image);
        let root = fs.root_entry();
        let mut ids = vec![root.node_id().expect(kind)];
        for path in ["/dir1", "/dir2", "/dir1/test.txt", "/dir2/test.txt", "/test.txt"] {
            ids.push(fs.resolve_path(path).expect(kind).node_id().expect(kind));
        }
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), ids.len(), "{kind}: {ids:?}");
    }
}

#[test]
fn fragmented_hfs_files_read_through_overflow_extents() {
    let data: Vec<u8> = (0..512 * 20).map(|i| (i % 251) as u8).collect();
    let tree = vec![TreeNode::file("big.bin", data.clone())];
    let options = HfsImageOptions {
        block_size: 512,
        catalog_node_size: 512,
        fragment_files: true,
        ..HfsImageOptions::default()
    };
    let fs = only_filesystem(build_hfsplus(&tree, &options).expect("build").bytes);
    let entry = fs.resolve_path("big.bin").expect("resolve");
    let file = fs.file(&entry).expect("file");
    assert_eq!(file.length(), data.len() as u64);
    assert_eq!(file.read_to_end().expect("read"), data);
    // Crosses from the last inline extent into the first overflow record.
    assert_eq!(file.read(7 * 512 + 500, 40).expect("read"), &data[7 * 512 + 500..8 * 512 + 28]);
    assert_eq!(file.read(data.len() as u64 - 4, 100).expect("tail"), &data[data.len() - 4..]);
    assert!(file.read(data.len() as u64, 10).expect("eof").is_empty());
}

#[test]
fn hfs_fork_maps_are_built_once_per_file() {
    let data: Vec<u8> = (0..512 * 20).map(|i| (i % 239) as u8).collect();
    let tree = vec![TreeNode::file("big.bin", data.clone())];
    let options = HfsImageOptions {
        block_size: 512,
        catalog_node_size: 512,
        fragment_files: true,
        ..HfsImageOptions::default()
    };
    let image = build_hfsplus(&tree, &options).expect("build").bytes;
    let device = SectorBlockDevice::new(MemoryByteDevice::read_only(image), 512).expect("device");
    let reader =
        HfsPlusReader::open(Arc::new(device), &MountOptions::default()).expect("open");

    let root = reader.root().expect("root");
    let children = reader.children(&root.locator).expect("children");
    let [Ok(big)] = children.as_slice() else {
        panic!("expected one file, got {children:?}");
    };
    let HfsLocator::File { id, fork } = &big.locator else {
        panic!("expected a file locator, got {:?}", big.locator);
    };
    let first = reader.data_fork_map(*id, fork).expect("map");
    let second = reader.data_fork_map(*id, fork).expect("map");
    assert!(Arc::ptr_eq(&first, &second));

    for offset in [0_u64, 7 * 512 + 500, 15 * 512] {
        let got = reader
            .read(&big.locator, data.len() as u64, offset, 64)
            .expect("read");
        let at = usize::try_from(offset).expect("offset");
        assert_eq!(got, &data[at..at + 64]);
    }
    assert!(Arc::ptr_eq(&first, &reader.data_fork_map(*id, fork).expect("map")));
}

#[test]
fn catalog_leaf_cycle_is_corruption() {
    let tree: Vec<TreeNode> = ["a.txt", "b.txt", "c.txt", "d.txt"]
        .iter()
        .map(|name| TreeNode::file(name, *b"data"))
        .collect();
    let options = HfsImageOptions {
        block_size: 512,
        catalog_node_size: 512,
        ..HfsImageOptions::default()
    };
    let mut image = build_hfsplus(&tree, &options).expect("build");

    // Leaf 2 holds at most one of the root's files, so listing the root
    // must follow its forward link.
    let at = image.catalog_node_offset(2);
    let leaf = NodeDescriptor::parse(&image.bytes[at..at + 512]).expect("descriptor");
    assert_eq!(leaf.kind, NodeKind::Leaf);
    image.bytes[at..at + 4].copy_from_slice(&2_u32.to_be_bytes());

    let fs = only_filesystem(image.bytes);
    let err = fs.list_entries(&fs.root_entry()).expect_err("cycle");
    assert!(err.is_corruption(), "{err:?}");
}

#[test]
fn space_accounting_matches_the_builders() {
    let tree = sample_tree();
    let hfs = build_hfsplus(&tree, &HfsImageOptions::default()).expect("hfs+");
    let fs = only_filesystem(hfs.bytes.clone());
    assert_eq!(fs.total_space(), hfs.bytes.len() as u64);
    assert_eq!(
        fs.free_space().expect("free"),
        u64::from(hfs.header.free_blocks) * 4096
    );

    // Five clusters in use plus sixteen spare, 512 bytes each.
    let fat = only_filesystem(build_fat(&tree, &FatImageOptions::default()).expect("fat"));
    assert_eq!(fat.total_space(), 21 * 512);
    assert_eq!(fat.free_space().expect("free"), 16 * 512);
    let listing = structure_listing(fat.as_ref()).expect("listing");
    assert!(listing.starts_with("type: fat vol: TESTVOL total: 10752 free: 8192\n"));
}

#[test]
fn file_backed_images_scan_like_memory_images() {
    let tree = sample_tree();
    let fat = build_fat(&tree, &FatImageOptions::default()).expect("fat");
    let disk = mbr_disk(&[Part::new(0x01, &fat)], &[]).expect("disk");

    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(&disk).expect("write");
    file.flush().expect("flush");

    let volumes = scan_path(file.path()).expect("scan");
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].partition.as_ref().map(|p| p.start_sector), Some(64));
    let fs = volumes[0].filesystem.as_ref().expect("mounted");
    assert_eq!(
        tree_listing(fs.as_ref()).expect("listing"),
        expected_sample_listing()
    );
}
