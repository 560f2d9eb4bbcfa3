#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use pfs::VolumeInfo;
use pfs_harness::{
    fat_image::{FatImageOptions, build_fat},
    hfs_image::{HfsImageOptions, build_hfsplus},
    sample_tree, scan_path, structure_listing,
};
use pfs_ondisk::FatType;
use std::env;
use std::fs;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("scan") => {
            let path = image_arg(&args)?;
            let infos: Vec<VolumeInfo> = scan_path(path)?.iter().map(|v| v.info()).collect();
            println!("{}", serde_json::to_string_pretty(&infos)?);
            Ok(())
        }
        Some("list") => list(image_arg(&args)?),
        Some("build-sample") => build_sample(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn image_arg(args: &[String]) -> Result<&Path> {
    args.get(1)
        .map(Path::new)
        .context("missing image path")
}

fn list(path: &Path) -> Result<()> {
    for volume in scan_path(path)? {
        match &volume.partition {
            Some(entry) => println!(
                "== partition {} at sector {} ({})",
                entry.index, entry.start_sector, entry.type_tag
            ),
            None => println!("== whole device"),
        }
        match &volume.filesystem {
            Ok(fs) => print!("{}", structure_listing(fs.as_ref())?),
            Err(err) => println!("not mounted: {err}"),
        }
    }
    Ok(())
}

fn build_sample(args: &[String]) -> Result<()> {
    let (Some(kind), Some(out)) = (args.first(), args.get(1)) else {
        bail!("usage: build-sample <hfsplus|hfsx|fat12|fat16|fat32> <output>");
    };
    let tree = sample_tree();
    let bytes = match kind.as_str() {
        "hfsplus" => build_hfsplus(&tree, &HfsImageOptions::default())?.bytes,
        "hfsx" => {
            let options = HfsImageOptions {
                case_sensitive: true,
                ..HfsImageOptions::default()
            };
            build_hfsplus(&tree, &options)?.bytes
        }
        "fat12" => build_fat(&tree, &FatImageOptions::with_type(FatType::Fat12))?,
        "fat16" => build_fat(&tree, &FatImageOptions::with_type(FatType::Fat16))?,
        "fat32" => build_fat(&tree, &FatImageOptions::with_type(FatType::Fat32))?,
        other => bail!("unknown image kind: {other}"),
    };
    fs::write(out, &bytes).with_context(|| format!("writing {out}"))?;
    println!("wrote {} bytes to {out}", bytes.len());
    Ok(())
}

fn print_usage() {
    eprintln!("pfs-harness <command>");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  scan <image>                    partition and volume summary as JSON");
    eprintln!("  list <image>                    structure listing of every mounted volume");
    eprintln!("  build-sample <kind> <output>    write the sample tree as hfsplus, hfsx,");
    eprintln!("                                  fat12, fat16 or fat32");
}
