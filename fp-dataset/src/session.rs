use crate::{
    common::*,
    dataset::{DatasetConfig, FloorPhotoDataset},
    manifest::IdRange,
};
use chrono::Local;
use sha2::{Digest, Sha256};

/// Exact-match version string of the session export format.
pub const SESSION_EXPORT_VERSION: &str = "1.1";

const SESSION_CLASS: &str = "FloorPhotoDataset";

/// Stream families covered by the content hashes: both concatenated
/// rect files, or every per-part floor-photo file of both streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashFamily {
    Rect,
    FloorPhoto,
}

impl HashFamily {
    pub fn key(&self) -> &'static str {
        match self {
            HashFamily::Rect => "rect",
            HashFamily::FloorPhoto => "fphoto",
        }
    }
}

/// The reproducibility record persisted next to a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub version: String,
    pub class: String,
    pub date_save: String,
    pub description: String,
    pub filename: String,
    pub floor_photo_ch: usize,
    pub floor_photo_size: usize,
    pub num_parts: usize,
    pub parts_id: Vec<IdRange>,
    pub parts_project_id: Vec<Vec<i64>>,
    pub rect_image_ch: usize,
    pub rect_image_size: usize,
    pub hash_rect_images: String,
    pub hash_floor_images: String,
}

/// The session currently attached to a dataset instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedSession {
    pub file: PathBuf,
    pub description: String,
}

fn file_digest(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn with_json_ext(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext == "json" => path.to_owned(),
        _ => path.with_extension("json"),
    }
}

fn read_record(path: &Path) -> Result<SessionRecord> {
    let reader = io::BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

impl FloorPhotoDataset {
    /// Chained content hash of one family of shard files.
    ///
    /// Each file's SHA-256 hex digest feeds a cumulative SHA-256, so
    /// both file contents and file order are pinned.
    pub fn family_hash(&self, family: HashFamily) -> Result<String> {
        let mut hasher = Sha256::new();
        match family {
            HashFamily::Rect => {
                hasher.update(file_digest(&self.x.rect_images)?);
                hasher.update(file_digest(&self.y.rect_images)?);
            }
            HashFamily::FloorPhoto => {
                for part in 0..self.total_parts() {
                    hasher.update(file_digest(&self.x.photo_parts[part])?);
                    hasher.update(file_digest(&self.y.photo_parts[part])?);
                }
            }
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn session_record(&self, description: &str) -> Result<SessionRecord> {
        Ok(SessionRecord {
            version: SESSION_EXPORT_VERSION.to_owned(),
            class: SESSION_CLASS.to_owned(),
            date_save: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            description: description.to_owned(),
            filename: self.config.stem.display().to_string(),
            floor_photo_ch: self.config.floor_photo_channels,
            floor_photo_size: self.config.floor_photo_size,
            num_parts: self.total_parts(),
            parts_id: self.parts.ranges.clone(),
            parts_project_id: self.parts.projects.clone(),
            rect_image_ch: self.config.rect_image_channels,
            rect_image_size: self.config.rect_image_size,
            hash_rect_images: self.family_hash(HashFamily::Rect)?,
            hash_floor_images: self.family_hash(HashFamily::FloorPhoto)?,
        })
    }

    /// Write a session record and attach it to this instance.
    pub fn save_session(&mut self, path: impl AsRef<Path>, description: &str) -> Result<()> {
        let path = with_json_ext(path.as_ref());
        let record = self.session_record(description)?;
        let writer = io::BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, &record)?;

        info!("saved session <{}>", path.display());
        self.session = Some(AttachedSession {
            file: path,
            description: description.to_owned(),
        });
        Ok(())
    }

    /// Load a session record and verify it against the current on-disk
    /// dataset. Any mismatch, including silent shard corruption or
    /// replacement, fails with a data-integrity error naming the field.
    pub fn load_session(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = with_json_ext(path.as_ref());
        if !path.is_file() {
            return Err(Error::MissingFile(path));
        }
        let record = read_record(&path)?;

        ensure_data!(
            record.version == SESSION_EXPORT_VERSION,
            "outdated session export version, needed {}, got {}",
            SESSION_EXPORT_VERSION,
            record.version
        );
        ensure_data!(
            record.class == SESSION_CLASS,
            "session class mismatch, expected {}, got {}",
            SESSION_CLASS,
            record.class
        );
        ensure_data!(
            self.family_hash(HashFamily::Rect)? == record.hash_rect_images,
            "rect image hash differs from session <{}>",
            path.display()
        );
        ensure_data!(
            self.family_hash(HashFamily::FloorPhoto)? == record.hash_floor_images,
            "floor image hash differs from session <{}>",
            path.display()
        );
        ensure_data!(
            self.parts.ranges == record.parts_id,
            "ID partition differs from session <{}>",
            path.display()
        );
        ensure_data!(
            self.parts.projects == record.parts_project_id,
            "project ID partition differs from session <{}>",
            path.display()
        );
        ensure_data!(
            self.config.rect_image_size == record.rect_image_size,
            "rect image size differs from session, expected {}, got {}",
            record.rect_image_size,
            self.config.rect_image_size
        );
        ensure_data!(
            self.config.floor_photo_size == record.floor_photo_size,
            "floor photo size differs from session, expected {}, got {}",
            record.floor_photo_size,
            self.config.floor_photo_size
        );

        self.session = Some(AttachedSession {
            file: path,
            description: record.description,
        });
        Ok(())
    }

    /// Re-save the attached session in place.
    pub fn update_session(&mut self) -> Result<()> {
        let session = self
            .session
            .clone()
            .ok_or_else(|| Error::Usage("no session attached".to_owned()))?;
        info!("updating session <{}>", session.file.display());
        self.save_session(&session.file, &session.description)
    }

    pub fn session(&self) -> Option<&AttachedSession> {
        self.session.as_ref()
    }
}

/// Rebuild a dataset purely from a session record, then replay
/// [`FloorPhotoDataset::load_session`] on it for verification. This is
/// the standard resume entry point.
pub fn load_from_session(path: impl AsRef<Path>) -> Result<FloorPhotoDataset> {
    let path = with_json_ext(path.as_ref());
    if !path.is_file() {
        return Err(Error::MissingFile(path));
    }
    let record = read_record(&path)?;
    ensure_data!(
        record.version == SESSION_EXPORT_VERSION,
        "outdated session export version, needed {}, got {}",
        SESSION_EXPORT_VERSION,
        record.version
    );

    let config = DatasetConfig {
        stem: PathBuf::from(&record.filename),
        rect_image_size: record.rect_image_size,
        floor_photo_size: record.floor_photo_size,
        rect_image_channels: record.rect_image_ch,
        floor_photo_channels: record.floor_photo_ch,
    };
    let mut dataset = FloorPhotoDataset::new(config)?;
    dataset.load_session(&path)?;
    Ok(dataset)
}
