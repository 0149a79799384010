use crate::{
    common::*,
    manifest::{load_manifest, IdRange, ManifestRecord, PartTable, NULL_RECT_ID},
    resample::{replicate_channels, resize_area},
    session::AttachedSession,
};
use ndarray::Ix3;
use ndarray_npy::{NpzReader, ReadableElement};

/// One of the two parallel dataset streams: `x` holds the
/// architectural rectifications, `y` the structural targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    X,
    Y,
}

impl Stream {
    pub fn key(&self) -> &'static str {
        match self {
            Stream::X => "x",
            Stream::Y => "y",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Stream selector for [`FloorPhotoDataset::load_part`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamSelector {
    X,
    Y,
    Xy,
}

impl StreamSelector {
    pub fn streams(&self) -> &'static [Stream] {
        match self {
            StreamSelector::X => &[Stream::X],
            StreamSelector::Y => &[Stream::Y],
            StreamSelector::Xy => &[Stream::X, Stream::Y],
        }
    }

    pub fn contains(&self, stream: Stream) -> bool {
        self.streams().contains(&stream)
    }

    pub fn key(&self) -> &'static str {
        match self {
            StreamSelector::X => "x",
            StreamSelector::Y => "y",
            StreamSelector::Xy => "xy",
        }
    }
}

impl FromStr for StreamSelector {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        match text {
            "x" => Ok(StreamSelector::X),
            "y" => Ok(StreamSelector::Y),
            "xy" => Ok(StreamSelector::Xy),
            _ => Err(Error::Usage(format!(
                "invalid stream selector <{}>, expected \"x\", \"y\" or \"xy\"",
                text
            ))),
        }
    }
}

impl fmt::Display for StreamSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Constructor arguments of [`FloorPhotoDataset`], immutable after
/// construction.
///
/// `stem` is the path prefix shared by every shard file of the
/// dataset, without extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetConfig {
    pub stem: PathBuf,
    pub rect_image_size: usize,
    pub floor_photo_size: usize,
    pub rect_image_channels: usize,
    pub floor_photo_channels: usize,
}

impl DatasetConfig {
    fn validate(&self) -> Result<()> {
        ensure_config!(
            self.rect_image_size.is_power_of_two(),
            "rect image size must be a positive power of two, got {}",
            self.rect_image_size
        );
        ensure_config!(
            self.floor_photo_size.is_power_of_two(),
            "floor photo size must be a positive power of two, got {}",
            self.floor_photo_size
        );
        ensure_config!(
            self.rect_image_channels >= 1,
            "rect image channel count must be at least 1, got {}",
            self.rect_image_channels
        );
        ensure_config!(
            self.floor_photo_channels >= 1,
            "floor photo channel count must be at least 1, got {}",
            self.floor_photo_channels
        );
        // Channel replication is only defined from a single channel.
        ensure_config!(
            self.rect_image_channels == self.floor_photo_channels
                || self.rect_image_channels == 1,
            "rect images must be single-channel to replicate into {} floor photo channels, got {}",
            self.floor_photo_channels,
            self.rect_image_channels
        );
        Ok(())
    }
}

/// The shard files and parsed manifest of one stream.
#[derive(Debug, Clone)]
pub(crate) struct StreamData {
    /// Concatenated rect images, all parts.
    pub(crate) rect_images: PathBuf,
    pub(crate) manifest: PathBuf,
    /// One floor-photo array file per part.
    pub(crate) photo_parts: Vec<PathBuf>,
    /// Manifest records indexed by global image id.
    pub(crate) records: Vec<ManifestRecord>,
}

/// The partitioned floor-photo dataset loader.
///
/// Owns the validated shard layout of both streams. Structural
/// metadata is computed once at construction and read-only thereafter;
/// pixel data is loaded per part on demand and owned by the caller.
#[derive(Debug)]
pub struct FloorPhotoDataset {
    pub(crate) config: DatasetConfig,
    pub(crate) parts: PartTable,
    pub(crate) x: StreamData,
    pub(crate) y: StreamData,
    pub(crate) session: Option<AttachedSession>,
}

fn derived_path(stem: &Path, suffix: String) -> PathBuf {
    PathBuf::from(format!("{}{}", stem.display(), suffix))
}

fn read_npz<T>(path: &Path) -> Result<ArrayD<T>>
where
    T: ReadableElement,
{
    let mut npz = NpzReader::new(File::open(path)?)?;
    Ok(npz.by_name("data")?)
}

impl FloorPhotoDataset {
    /// Open a dataset: validate the configuration, derive and check
    /// every shard path, parse both manifests, and reconcile them.
    pub fn new(config: DatasetConfig) -> Result<Self> {
        config.validate()?;
        let stem = &config.stem;

        let rect_x = derived_path(stem, format!("_images_x_{}.npz", config.rect_image_size));
        let rect_y = derived_path(stem, format!("_images_y_{}.npz", config.rect_image_size));
        for path in [&rect_x, &rect_y] {
            if !path.is_file() {
                return Err(Error::MissingFile(path.clone()));
            }
        }

        let manifest_x_path = derived_path(
            stem,
            format!("_rect_floor_photo_x_{}_files.csv", config.floor_photo_size),
        );
        let manifest_y_path = derived_path(
            stem,
            format!("_rect_floor_photo_y_{}_files.csv", config.floor_photo_size),
        );
        let manifest_x = load_manifest(&manifest_x_path)?;
        let manifest_y = load_manifest(&manifest_y_path)?;

        ensure_data!(
            manifest_x.parts.total_parts() == manifest_y.parts.total_parts(),
            "number of parts differs between x and y manifests: {} vs {}",
            manifest_x.parts.total_parts(),
            manifest_y.parts.total_parts()
        );
        ensure_data!(
            manifest_x.parts.ranges == manifest_y.parts.ranges,
            "ID partition of parts differs between x and y manifests"
        );
        ensure_data!(
            manifest_x.parts.projects == manifest_y.parts.projects,
            "project partition of parts differs between x and y manifests"
        );
        let parts = manifest_x.parts.clone();

        let mut photo_x = Vec::with_capacity(parts.total_parts());
        let mut photo_y = Vec::with_capacity(parts.total_parts());
        for part in 1..=parts.total_parts() {
            let px = derived_path(
                stem,
                format!(
                    "_rect_floor_photo_x_{}_part{}.npz",
                    config.floor_photo_size, part
                ),
            );
            let py = derived_path(
                stem,
                format!(
                    "_rect_floor_photo_y_{}_part{}.npz",
                    config.floor_photo_size, part
                ),
            );
            if !px.is_file() {
                return Err(Error::MissingFile(px));
            }
            if !py.is_file() {
                return Err(Error::MissingFile(py));
            }
            photo_x.push(px);
            photo_y.push(py);
        }

        info!(
            "opened dataset <{}>: {} parts, output image shape ({}, {}, {})",
            stem.display(),
            parts.total_parts(),
            config.floor_photo_size,
            config.floor_photo_size,
            config.floor_photo_channels
        );

        Ok(Self {
            x: StreamData {
                rect_images: rect_x,
                manifest: manifest_x_path,
                photo_parts: photo_x,
                records: manifest_x.records,
            },
            y: StreamData {
                rect_images: rect_y,
                manifest: manifest_y_path,
                photo_parts: photo_y,
                records: manifest_y.records,
            },
            parts,
            config,
            session: None,
        })
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn parts(&self) -> &PartTable {
        &self.parts
    }

    pub fn total_parts(&self) -> usize {
        self.parts.total_parts()
    }

    /// Output image shape `(height, width, channels)`.
    ///
    /// Rect images are resampled to the floor-photo geometry, so both
    /// arrays of a loaded bundle share this shape.
    pub fn image_shape(&self) -> (usize, usize, usize) {
        (
            self.config.floor_photo_size,
            self.config.floor_photo_size,
            self.config.floor_photo_channels,
        )
    }

    pub(crate) fn stream_data(&self, stream: Stream) -> &StreamData {
        match stream {
            Stream::X => &self.x,
            Stream::Y => &self.y,
        }
    }

    /// Load one part into memory.
    ///
    /// Re-reads from disk on every call; repeated loads of the same
    /// part with unchanged files are bit-identical (unless shuffled).
    /// The returned bundle is exclusively owned by the caller and never
    /// cached by the dataset.
    pub fn load_part(
        &self,
        part: usize,
        xy: StreamSelector,
        remove_null: bool,
        shuffle: bool,
    ) -> Result<PartBundle> {
        ensure_usage!(
            (1..=self.total_parts()).contains(&part),
            "part number overflow, min 1, max {}, got {}",
            self.total_parts(),
            part
        );
        let range = self.parts.ranges[part - 1];

        let mut bundle = PartBundle {
            part,
            xy,
            x: None,
            y: None,
            size_mb: 0.0,
        };
        for &stream in xy.streams() {
            let loaded = self.load_stream_part(part, range, stream, remove_null, shuffle)?;
            match stream {
                Stream::X => bundle.x = Some(loaded),
                Stream::Y => bundle.y = Some(loaded),
            }
        }
        bundle.size_mb = bundle
            .x
            .iter()
            .chain(&bundle.y)
            .map(StreamBundle::size_mb)
            .sum();

        debug!(
            "loaded part {} ({}): {:.1} MiB resident",
            part, xy, bundle.size_mb
        );
        Ok(bundle)
    }

    fn load_stream_part(
        &self,
        part: usize,
        range: IdRange,
        stream: Stream,
        remove_null: bool,
        shuffle: bool,
    ) -> Result<StreamBundle> {
        let data = self.stream_data(stream);
        let photo_size = self.config.floor_photo_size;
        let photo_ch = self.config.floor_photo_channels;

        // The concatenated rect array spans every part; it is dropped
        // as soon as this part's slice has been normalized, before the
        // floor photos are read, to bound peak memory.
        let mut rect = {
            let full: ArrayD<f32> = read_npz(&data.rect_images)?;
            ensure_data!(
                full.ndim() == 3 || full.ndim() == 4,
                "rect image array <{}> must be 3- or 4-dimensional, got {} dimensions",
                data.rect_images.display(),
                full.ndim()
            );
            ensure_data!(
                (range.last as usize) < full.len_of(Axis(0)),
                "rect image array <{}> holds {} images but part <{}> spans ids {}..={}",
                data.rect_images.display(),
                full.len_of(Axis(0)),
                part,
                range.first,
                range.last
            );
            let mut rect = Array4::zeros((range.len(), photo_size, photo_size, photo_ch));
            for (row, id) in range.ids().enumerate() {
                let img = normalize_rect_image(
                    &self.config,
                    full.index_axis(Axis(0), id as usize),
                    part,
                    id,
                )?;
                rect.index_axis_mut(Axis(0), row).assign(&img);
            }
            rect
        };

        let mut fphoto = {
            let path = &data.photo_parts[part - 1];
            let raw: ArrayD<u8> = read_npz(path)?;
            ensure_data!(
                raw.len_of(Axis(0)) == rect.len_of(Axis(0)),
                "floor photo count differs from rect image count at part <{}>: {} vs {}",
                part,
                raw.len_of(Axis(0)),
                rect.len_of(Axis(0))
            );
            to_photo_array(&self.config, raw, path)?
        };

        let mut ids = IdTable::from_records(&data.records, range, &data.manifest)?;

        let mut removed = 0;
        if remove_null {
            let keep: Vec<usize> = (0..ids.len())
                .filter(|&i| ids.rect[i] != NULL_RECT_ID)
                .collect();
            removed = ids.len() - keep.len();
            if removed > 0 {
                rect = rect.select(Axis(0), &keep);
                fphoto = fphoto.select(Axis(0), &keep);
                ids = ids.select(&keep);
            }
        }

        if shuffle {
            let mut order: Vec<usize> = (0..ids.len()).collect();
            order.shuffle(&mut rand::thread_rng());
            rect = rect.select(Axis(0), &order);
            fphoto = fphoto.select(Axis(0), &order);
            ids = ids.select(&order);
        }

        Ok(StreamBundle {
            rect,
            fphoto,
            ids,
            removed,
        })
    }
}

/// Normalize one rect image to the floor-photo geometry.
///
/// Input pixels must be normalized floats: minimum exactly 0 and
/// maximum at most 1 after the 8-bit coercion. Violations are fatal.
fn normalize_rect_image(
    config: &DatasetConfig,
    img: ArrayViewD<'_, f32>,
    part: usize,
    id: i64,
) -> Result<Array3<u8>> {
    let img = match img.ndim() {
        2 => {
            ensure_data!(
                config.rect_image_channels == 1,
                "rect image at pos <{}> of part <{}> has no channel axis but {} channels are configured",
                id,
                part,
                config.rect_image_channels
            );
            img.insert_axis(Axis(2))
        }
        3 => img,
        n => {
            return Err(Error::DataIntegrity(format!(
                "rect image at pos <{}> of part <{}> must be 2- or 3-dimensional, got {} dimensions",
                id, part, n
            )))
        }
    };
    let img = img.into_dimensionality::<Ix3>()?;
    let (h, w, ch) = img.dim();
    ensure_data!(
        h == w,
        "rect image at pos <{}> of part <{}> must be square, got {}x{}",
        id,
        part,
        h,
        w
    );
    ensure_data!(
        h == config.rect_image_size,
        "rect image size at pos <{}> of part <{}> must equal configured size {}, got {}",
        id,
        part,
        config.rect_image_size,
        h
    );
    ensure_data!(
        ch == config.rect_image_channels,
        "invalid number of rect image channels at pos <{}> of part <{}>: expected {}, got {}",
        id,
        part,
        config.rect_image_channels,
        ch
    );

    // Coerce to the 8-bit pixel dtype before any geometry change.
    let mut img: Array3<u8> = img.mapv(|v| v as u8);
    if config.rect_image_size != config.floor_photo_size {
        img = resize_area(&img, config.floor_photo_size);
    }
    if config.rect_image_channels != config.floor_photo_channels {
        img = replicate_channels(&img, config.floor_photo_channels);
    }

    let min = img.fold(u8::MAX, |acc, &v| acc.min(v));
    let max = img.fold(u8::MIN, |acc, &v| acc.max(v));
    ensure_data!(
        min == 0,
        "invalid rect image min value at pos <{}> of part <{}>: must be 0, got {}",
        id,
        part,
        min
    );
    ensure_data!(
        max <= 1,
        "invalid rect image max value at pos <{}> of part <{}>: must be at most 1, got {}",
        id,
        part,
        max
    );

    Ok(img.mapv(|v| v * 255))
}

/// Verify a raw per-part floor-photo array and give it an explicit
/// channel axis.
fn to_photo_array(config: &DatasetConfig, raw: ArrayD<u8>, path: &Path) -> Result<Array4<u8>> {
    let raw = match raw.ndim() {
        3 => {
            ensure_data!(
                config.floor_photo_channels == 1,
                "floor photo array <{}> has no channel axis but {} channels are configured",
                path.display(),
                config.floor_photo_channels
            );
            raw.insert_axis(Axis(3))
        }
        4 => raw,
        n => {
            return Err(Error::DataIntegrity(format!(
                "floor photo array <{}> must be 3- or 4-dimensional, got {} dimensions",
                path.display(),
                n
            )))
        }
    };
    let arr = raw.into_dimensionality::<Ix4>()?;
    let (_, h, w, ch) = arr.dim();
    ensure_data!(
        h == w,
        "floor photo images in <{}> must be square, got {}x{}",
        path.display(),
        h,
        w
    );
    ensure_data!(
        h == config.floor_photo_size,
        "floor photo image size in <{}> must equal configured size {}, got {}",
        path.display(),
        config.floor_photo_size,
        h
    );
    ensure_data!(
        ch == config.floor_photo_channels,
        "invalid number of floor photo channels in <{}>: expected {}, got {}",
        path.display(),
        config.floor_photo_channels,
        ch
    );
    Ok(arr)
}

/// Provenance ids of every image in a loaded part, kept in lockstep
/// with the pixel arrays.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdTable {
    pub image: Vec<i64>,
    pub rect: Vec<i64>,
    pub project: Vec<i64>,
    pub mutator: Vec<i64>,
}

impl IdTable {
    fn from_records(records: &[ManifestRecord], range: IdRange, manifest: &Path) -> Result<Self> {
        let mut table = Self::default();
        for id in range.ids() {
            let record = records.get(id as usize).ok_or_else(|| {
                Error::DataIntegrity(format!(
                    "manifest <{}> holds no record for image id <{}>",
                    manifest.display(),
                    id
                ))
            })?;
            table.image.push(record.image_id);
            table.rect.push(record.rect.id());
            table.project.push(record.project_id);
            table.mutator.push(record.mutator_id);
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    /// Position of the image with the given rect and mutator id.
    pub fn position_of(&self, rect_id: i64, mutator_id: i64) -> Option<usize> {
        self.rect
            .iter()
            .zip(&self.mutator)
            .position(|(&rect, &mutator)| rect == rect_id && mutator == mutator_id)
    }

    fn select(&self, indices: &[usize]) -> Self {
        let gather = |source: &[i64]| indices.iter().map(|&i| source[i]).collect();
        Self {
            image: gather(&self.image),
            rect: gather(&self.rect),
            project: gather(&self.project),
            mutator: gather(&self.mutator),
        }
    }
}

/// One stream's worth of a loaded part.
#[derive(Debug, Clone)]
pub struct StreamBundle {
    /// Rect images, `(n, size, size, ch)` in the floor-photo geometry.
    pub rect: Array4<u8>,
    /// Floor photos, `(n, size, size, ch)`.
    pub fphoto: Array4<u8>,
    pub ids: IdTable,
    /// Images dropped by null filtering.
    pub removed: usize,
}

impl StreamBundle {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Estimated in-memory footprint in mebibytes.
    pub fn size_mb(&self) -> f64 {
        let pixels = self.rect.len() + self.fphoto.len();
        let ids = 4 * self.ids.len() * std::mem::size_of::<i64>();
        (pixels + ids) as f64 / (1024.0 * 1024.0)
    }
}

/// The bundle returned by [`FloorPhotoDataset::load_part`]: one
/// [`StreamBundle`] per requested stream plus load metadata.
#[derive(Debug, Clone)]
pub struct PartBundle {
    pub part: usize,
    pub xy: StreamSelector,
    pub x: Option<StreamBundle>,
    pub y: Option<StreamBundle>,
    /// Estimated total footprint in mebibytes.
    pub size_mb: f64,
}

impl PartBundle {
    pub fn stream(&self, stream: Stream) -> Option<&StreamBundle> {
        match stream {
            Stream::X => self.x.as_ref(),
            Stream::Y => self.y.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(stem: &str) -> DatasetConfig {
        DatasetConfig {
            stem: PathBuf::from(stem),
            rect_image_size: 64,
            floor_photo_size: 64,
            rect_image_channels: 1,
            floor_photo_channels: 1,
        }
    }

    #[test]
    fn selector_parsing() {
        assert_eq!("x".parse::<StreamSelector>().unwrap(), StreamSelector::X);
        assert_eq!("y".parse::<StreamSelector>().unwrap(), StreamSelector::Y);
        assert_eq!("xy".parse::<StreamSelector>().unwrap(), StreamSelector::Xy);
        let err = "z".parse::<StreamSelector>().unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn selector_streams() {
        assert_eq!(StreamSelector::Xy.streams(), &[Stream::X, Stream::Y]);
        assert!(StreamSelector::X.contains(Stream::X));
        assert!(!StreamSelector::X.contains(Stream::Y));
    }

    #[test]
    fn config_rejects_non_power_of_two_sizes() {
        let mut bad = config("data");
        bad.rect_image_size = 100;
        assert!(matches!(
            FloorPhotoDataset::new(bad).unwrap_err(),
            Error::Config(_)
        ));

        let mut bad = config("data");
        bad.floor_photo_size = 0;
        assert!(matches!(
            FloorPhotoDataset::new(bad).unwrap_err(),
            Error::Config(_)
        ));
    }

    #[test]
    fn config_rejects_zero_channels() {
        let mut bad = config("data");
        bad.floor_photo_channels = 0;
        assert!(matches!(
            FloorPhotoDataset::new(bad).unwrap_err(),
            Error::Config(_)
        ));
    }

    #[test]
    fn config_rejects_unreplicable_channels() {
        let mut bad = config("data");
        bad.rect_image_channels = 3;
        bad.floor_photo_channels = 4;
        assert!(matches!(
            FloorPhotoDataset::new(bad).unwrap_err(),
            Error::Config(_)
        ));
    }

    #[test]
    fn missing_rect_file_is_reported() {
        let err = FloorPhotoDataset::new(config("/nonexistent/data")).unwrap_err();
        match err {
            Error::MissingFile(path) => {
                assert_eq!(path, PathBuf::from("/nonexistent/data_images_x_64.npz"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn id_table_select_keeps_lockstep() {
        let table = IdTable {
            image: vec![0, 1, 2, 3],
            rect: vec![10, -1, 12, 13],
            project: vec![7, 7, 8, 8],
            mutator: vec![0, 1, 2, 3],
        };
        let selected = table.select(&[3, 0]);
        assert_eq!(selected.image, vec![3, 0]);
        assert_eq!(selected.rect, vec![13, 10]);
        assert_eq!(selected.project, vec![8, 7]);
        assert_eq!(selected.mutator, vec![3, 0]);
    }

    #[test]
    fn id_table_position_lookup() {
        let table = IdTable {
            image: vec![0, 1, 2],
            rect: vec![10, 10, 12],
            project: vec![7, 7, 7],
            mutator: vec![0, 1, 0],
        };
        assert_eq!(table.position_of(10, 1), Some(1));
        assert_eq!(table.position_of(12, 0), Some(2));
        assert_eq!(table.position_of(10, 9), None);
    }
}
