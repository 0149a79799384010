use anyhow::Result;
use clap::Parser;
use fp_dataset::{
    load_from_session, DatasetConfig, FloorPhotoDataset, HashFamily, Stream, StreamSelector,
};
use prettytable::{cell, row, Table};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
enum Opts {
    /// Print the dataset structure and per-part id ranges.
    Info(DatasetOpts),
    /// Print the rect and floor-photo family hashes.
    Hash(DatasetOpts),
    /// Write a session record for the dataset.
    SaveSession {
        #[clap(flatten)]
        dataset: DatasetOpts,
        /// output session file
        output_file: PathBuf,
        /// session description
        #[clap(long, default_value = "")]
        description: String,
    },
    /// Rebuild a dataset from a session record and verify it.
    VerifySession {
        /// session file
        session_file: PathBuf,
    },
    /// Load one part and report bundle statistics.
    LoadPart {
        #[clap(flatten)]
        dataset: DatasetOpts,
        /// part number, 1-indexed
        part: usize,
        /// streams to load: "x", "y" or "xy"
        #[clap(long, default_value = "xy")]
        xy: String,
        /// drop images whose rect id is the null sentinel
        #[clap(long)]
        remove_null: bool,
        /// shuffle the loaded part
        #[clap(long)]
        shuffle: bool,
    },
}

#[derive(Debug, Clone, clap::Args)]
struct DatasetOpts {
    /// dataset file stem, the path prefix shared by all shard files
    stem: PathBuf,
    /// rect image edge size in pixels
    #[clap(long, default_value_t = 256)]
    rect_size: usize,
    /// floor photo edge size in pixels
    #[clap(long, default_value_t = 256)]
    photo_size: usize,
    /// rect image channel count
    #[clap(long, default_value_t = 1)]
    rect_channels: usize,
    /// floor photo channel count
    #[clap(long, default_value_t = 1)]
    photo_channels: usize,
}

impl DatasetOpts {
    fn open(&self) -> Result<FloorPhotoDataset> {
        let dataset = FloorPhotoDataset::new(DatasetConfig {
            stem: self.stem.clone(),
            rect_image_size: self.rect_size,
            floor_photo_size: self.photo_size,
            rect_image_channels: self.rect_channels,
            floor_photo_channels: self.photo_channels,
        })?;
        Ok(dataset)
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    match Opts::parse() {
        Opts::Info(dataset) => {
            info(&dataset)?;
        }
        Opts::Hash(dataset) => {
            hash(&dataset)?;
        }
        Opts::SaveSession {
            dataset,
            output_file,
            description,
        } => {
            save_session(&dataset, output_file, &description)?;
        }
        Opts::VerifySession { session_file } => {
            verify_session(session_file)?;
        }
        Opts::LoadPart {
            dataset,
            part,
            xy,
            remove_null,
            shuffle,
        } => {
            load_part(&dataset, part, &xy, remove_null, shuffle)?;
        }
    }

    Ok(())
}

fn info(opts: &DatasetOpts) -> Result<()> {
    let dataset = opts.open()?;
    let (height, width, channels) = dataset.image_shape();
    println!("stem:         {}", dataset.config().stem.display());
    println!("parts:        {}", dataset.total_parts());
    println!("output shape: ({}, {}, {})", height, width, channels);

    let mut table = Table::new();
    table.add_row(row!["part", "first id", "last id", "images", "projects"]);
    for part in 1..=dataset.total_parts() {
        let range = dataset.parts().range(part).unwrap();
        let projects = dataset
            .parts()
            .part_projects(part)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        table.add_row(row![part, range.first, range.last, range.len(), projects]);
    }
    table.printstd();

    Ok(())
}

fn hash(opts: &DatasetOpts) -> Result<()> {
    let dataset = opts.open()?;
    for family in [HashFamily::Rect, HashFamily::FloorPhoto] {
        println!("{}: {}", family.key(), dataset.family_hash(family)?);
    }
    Ok(())
}

fn save_session(opts: &DatasetOpts, output_file: PathBuf, description: &str) -> Result<()> {
    let mut dataset = opts.open()?;
    dataset.save_session(&output_file, description)?;
    println!("session saved to <{}>", dataset.session().unwrap().file.display());
    Ok(())
}

fn verify_session(session_file: PathBuf) -> Result<()> {
    let dataset = load_from_session(&session_file)?;
    println!(
        "session ok: {} parts, stem <{}>",
        dataset.total_parts(),
        dataset.config().stem.display()
    );
    Ok(())
}

fn load_part(opts: &DatasetOpts, part: usize, xy: &str, remove_null: bool, shuffle: bool) -> Result<()> {
    let selector: StreamSelector = xy.parse()?;
    let dataset = opts.open()?;
    let bundle = dataset.load_part(part, selector, remove_null, shuffle)?;

    for stream in [Stream::X, Stream::Y] {
        if let Some(loaded) = bundle.stream(stream) {
            println!(
                "{}: {} images, {} removed, rect {:?}, fphoto {:?}",
                stream,
                loaded.len(),
                loaded.removed,
                loaded.rect.dim(),
                loaded.fphoto.dim(),
            );
        }
    }
    println!("estimated footprint: {:.1} MiB", bundle.size_mb);

    Ok(())
}
