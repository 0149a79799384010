use crate::common::*;

/// The `[NULL]` marker found in manifest rows of images that have no
/// associated rectangle.
const NULL_MARKER: &str = "[NULL]";

/// Sentinel rect id reported for images without a rectangle.
pub const NULL_RECT_ID: i64 = -1;

/// The rect-id field of a manifest record.
///
/// Images without an associated rectangle are encoded with a leading
/// `[NULL]` marker that shifts every later field by one position. The
/// marker is only recognized in the leading field, never elsewhere in
/// the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RectRef {
    Present(i64),
    Null,
}

impl RectRef {
    /// The rect id, with [`NULL_RECT_ID`] standing in for a missing
    /// rectangle.
    pub fn id(&self) -> i64 {
        match *self {
            RectRef::Present(id) => id,
            RectRef::Null => NULL_RECT_ID,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RectRef::Null)
    }
}

/// One parsed row of a part-index manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestRecord {
    pub image_id: i64,
    pub rect: RectRef,
    pub project_id: i64,
    pub mutator_id: i64,
    pub part: usize,
}

#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(rename = "ID")]
    id: i64,
    #[serde(rename = "File")]
    file: String,
}

fn parse_field<T>(field: &str, what: &str, row: &str) -> Result<T>
where
    T: FromStr,
{
    field.parse().map_err(|_| {
        Error::DataIntegrity(format!(
            "malformed {} field <{}> in manifest row <{}>",
            what, field, row
        ))
    })
}

impl ManifestRecord {
    /// Decode the hyphen-delimited `File` field of a manifest row.
    ///
    /// Two encodings exist: `rect-project-mutator-partN` and
    /// `[NULL]-rect-project-mutator-partN`, the latter for images
    /// without a rectangle.
    fn parse(image_id: i64, file: &str) -> Result<Self> {
        let fields: Vec<&str> = file.split('-').map(str::trim).collect();
        let (rect, tail) = match fields.as_slice() {
            [marker, _orig_rect, tail @ ..] if *marker == NULL_MARKER => (RectRef::Null, tail),
            [rect_id, tail @ ..] if *rect_id != NULL_MARKER => (
                RectRef::Present(parse_field(rect_id, "rect id", file)?),
                tail,
            ),
            _ => {
                return Err(Error::DataIntegrity(format!(
                    "wrong field count in manifest row <{}>",
                    file
                )))
            }
        };
        let (project, mutator, part) = match tail {
            [project, mutator, part] => (project, mutator, part),
            _ => {
                return Err(Error::DataIntegrity(format!(
                    "wrong field count in manifest row <{}>",
                    file
                )))
            }
        };

        let part_number = part.strip_prefix("part").ok_or_else(|| {
            Error::DataIntegrity(format!(
                "manifest row <{}> does not end with a part token",
                file
            ))
        })?;

        Ok(Self {
            image_id,
            rect,
            project_id: parse_field(project, "project id", file)?,
            mutator_id: parse_field(mutator, "mutator id", file)?,
            part: parse_field(part_number, "part number", file)?,
        })
    }
}

/// An inclusive range of global image ids belonging to one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(i64, i64)", into = "(i64, i64)")]
pub struct IdRange {
    pub first: i64,
    pub last: i64,
}

impl IdRange {
    pub fn len(&self) -> usize {
        (self.last - self.first + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }

    pub fn ids(&self) -> std::ops::RangeInclusive<i64> {
        self.first..=self.last
    }
}

impl From<(i64, i64)> for IdRange {
    fn from((first, last): (i64, i64)) -> Self {
        Self { first, last }
    }
}

impl From<IdRange> for (i64, i64) {
    fn from(range: IdRange) -> Self {
        (range.first, range.last)
    }
}

/// The per-part structure of a manifest: the id range and the observed
/// project ids of every part, with part `k` stored at index `k - 1`.
///
/// Both streams of a dataset must produce value-equal tables; the
/// derived equality is what the cross-stream check relies on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartTable {
    /// Inclusive global-id range per part.
    pub ranges: Vec<IdRange>,
    /// Project ids observed per part, in first-seen order.
    pub projects: Vec<Vec<i64>>,
}

impl PartTable {
    pub fn total_parts(&self) -> usize {
        self.ranges.len()
    }

    /// The id range of a 1-indexed part.
    pub fn range(&self, part: usize) -> Option<IdRange> {
        part.checked_sub(1).and_then(|k| self.ranges.get(k)).copied()
    }

    /// The project ids of a 1-indexed part.
    pub fn part_projects(&self, part: usize) -> Option<&[i64]> {
        part.checked_sub(1)
            .and_then(|k| self.projects.get(k))
            .map(Vec::as_slice)
    }

    /// Seal per-part ranges from the ordered manifest records.
    ///
    /// A part boundary is a change of part number between consecutive
    /// records; the just-closed part's `(first, last)` is sealed at
    /// each boundary. The pre-loop part 0 is a parsing artifact and is
    /// dropped before validation.
    fn from_records(records: &[ManifestRecord], path: &Path) -> Result<Self> {
        let declared = match records.last() {
            Some(record) => record.part,
            None => {
                return Err(Error::DataIntegrity(format!(
                    "manifest <{}> holds no records",
                    path.display()
                )))
            }
        };
        ensure_data!(
            declared > 1,
            "manifest <{}>: total part count must be greater than 1, got {}",
            path.display(),
            declared
        );

        let mut ranges: IndexMap<usize, IdRange> = IndexMap::new();
        let mut projects: IndexMap<usize, Vec<i64>> = IndexMap::new();
        projects.insert(0, vec![]);

        let mut last_part = 0;
        let mut first_id = 0;
        let mut last_id = 0;
        for record in records {
            if record.part != last_part {
                ranges.insert(
                    last_part,
                    IdRange {
                        first: first_id,
                        last: last_id,
                    },
                );
                last_part = record.part;
                first_id = record.image_id;
            }
            last_id = record.image_id;
            let membership = projects.entry(record.part).or_insert_with(Vec::new);
            if !membership.contains(&record.project_id) {
                membership.push(record.project_id);
            }
        }
        ranges.insert(
            last_part,
            IdRange {
                first: first_id,
                last: last_id,
            },
        );
        ranges.shift_remove(&0);
        projects.shift_remove(&0);

        ensure_data!(
            ranges.len() == declared,
            "manifest <{}>: number of parts does not match, sealed {} but the last row declares {}",
            path.display(),
            ranges.len(),
            declared
        );
        let keys: Vec<usize> = ranges.keys().copied().collect();
        // Global ids index both the record list and the concatenated
        // rect array, so the id space must start at or above zero.
        ensure_data!(
            ranges[&keys[0]].first >= 0,
            "manifest <{}>: part {} starts at negative image id {}",
            path.display(),
            keys[0],
            ranges[&keys[0]].first
        );
        for (&prev, &next) in keys.iter().tuple_windows() {
            ensure_data!(
                next == prev + 1,
                "manifest <{}>: part numbers must differ by one unit, got {} then {}",
                path.display(),
                prev,
                next
            );
            ensure_data!(
                ranges[&next].first == ranges[&prev].last + 1,
                "manifest <{}>: part {} breaks lower id continuity with part {}",
                path.display(),
                next,
                prev
            );
        }
        for (&part, range) in &ranges {
            ensure_data!(
                range.last - range.first >= 1,
                "manifest <{}>: part {} holds fewer than two images",
                path.display(),
                part
            );
        }

        Ok(Self {
            ranges: ranges.into_values().collect(),
            projects: projects.into_values().collect(),
        })
    }
}

/// A parsed part-index manifest: the ordered records, indexed by global
/// image id, plus the sealed per-part structure.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub records: Vec<ManifestRecord>,
    pub parts: PartTable,
}

/// Parse a part-index manifest file.
///
/// The file is a two-column CSV with an `ID,File` header; blank lines
/// are skipped. Records are assumed sorted by ascending global id and
/// contiguous per part.
pub fn load_manifest(path: impl AsRef<Path>) -> Result<Manifest> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(Error::MissingFile(path.to_owned()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let records: Vec<ManifestRecord> = reader
        .deserialize()
        .map(|row| {
            let RawRow { id, file } = row?;
            ManifestRecord::parse(id, &file)
        })
        .try_collect()?;

    let parts = PartTable::from_records(&records, path)?;
    Ok(Manifest { records, parts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_manifest(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ID,File").unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    #[test]
    fn parse_present_record() {
        let record = ManifestRecord::parse(219712, "18581 - 61 - 6 - part119").unwrap();
        assert_eq!(
            record,
            ManifestRecord {
                image_id: 219712,
                rect: RectRef::Present(18581),
                project_id: 61,
                mutator_id: 6,
                part: 119,
            }
        );
    }

    #[test]
    fn parse_null_record() {
        let record = ManifestRecord::parse(7, "[NULL] - 18581 - 61 - 6 - part2").unwrap();
        assert_eq!(record.rect, RectRef::Null);
        assert_eq!(record.rect.id(), NULL_RECT_ID);
        assert_eq!(record.project_id, 61);
        assert_eq!(record.mutator_id, 6);
        assert_eq!(record.part, 2);
    }

    #[test]
    fn parse_rejects_wrong_field_count() {
        assert!(ManifestRecord::parse(0, "1-2-3").is_err());
        assert!(ManifestRecord::parse(0, "1-2-3-4-5-part1").is_err());
    }

    #[test]
    fn parse_rejects_missing_part_token() {
        let err = ManifestRecord::parse(0, "1-2-3-4").unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)));
    }

    #[test]
    fn load_two_part_manifest() {
        let file = write_manifest(&[
            "0,10-7-0-part1",
            "1,11-7-1-part1",
            "2,[NULL]-12-7-0-part2",
            "3,13-8-1-part2",
        ]);
        let manifest = load_manifest(file.path()).unwrap();
        assert_eq!(manifest.records.len(), 4);
        assert_eq!(manifest.parts.total_parts(), 2);
        assert_eq!(
            manifest.parts.ranges,
            vec![IdRange { first: 0, last: 1 }, IdRange { first: 2, last: 3 }]
        );
        assert_eq!(manifest.parts.projects, vec![vec![7], vec![7, 8]]);
    }

    #[test]
    fn ranges_reconstruct_contiguously() {
        let file = write_manifest(&[
            "0,10-7-0-part1",
            "1,11-7-1-part1",
            "2,12-7-0-part2",
            "3,13-7-1-part2",
            "4,14-7-0-part3",
            "5,15-7-1-part3",
        ]);
        let manifest = load_manifest(file.path()).unwrap();
        let ranges = &manifest.parts.ranges;
        assert!(ranges.iter().all(|range| range.len() >= 2));
        for (prev, next) in ranges.iter().tuple_windows() {
            assert_eq!(next.first, prev.last + 1);
        }
    }

    #[test]
    fn single_part_manifest_is_rejected() {
        let file = write_manifest(&["0,10-7-0-part1", "1,11-7-1-part1"]);
        let err = load_manifest(file.path()).unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)));
    }

    #[test]
    fn id_gap_between_parts_is_rejected() {
        let file = write_manifest(&[
            "0,10-7-0-part1",
            "1,11-7-1-part1",
            "3,12-7-0-part2",
            "4,13-7-1-part2",
        ]);
        let err = load_manifest(file.path()).unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)));
    }

    #[test]
    fn skipped_part_number_is_rejected() {
        let file = write_manifest(&[
            "0,10-7-0-part1",
            "1,11-7-1-part1",
            "2,12-7-0-part3",
            "3,13-7-1-part3",
        ]);
        let err = load_manifest(file.path()).unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)));
    }

    #[test]
    fn undersized_part_is_rejected() {
        let file = write_manifest(&[
            "0,10-7-0-part1",
            "1,11-7-1-part1",
            "2,12-7-0-part2",
        ]);
        let err = load_manifest(file.path()).unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)));
    }

    #[test]
    fn negative_ids_are_rejected() {
        // Satisfies contiguity, step-by-one, and size invariants, but
        // the id space must not dip below zero.
        let file = write_manifest(&[
            "-1,100-7-0-part1",
            "0,101-7-1-part1",
            "1,102-7-0-part2",
            "2,103-7-1-part2",
        ]);
        let err = load_manifest(file.path()).unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)));
    }

    #[test]
    fn missing_manifest_file() {
        let err = load_manifest("/nonexistent/manifest.csv").unwrap_err();
        assert!(matches!(err, Error::MissingFile(_)));
    }

    #[test]
    fn id_range_serializes_as_pair() {
        let range = IdRange { first: 3, last: 9 };
        let json = serde_json::to_string(&range).unwrap();
        assert_eq!(json, "[3,9]");
        let back: IdRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, range);
    }
}
