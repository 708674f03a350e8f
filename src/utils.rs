use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

const PREFIX_LEN: usize = 2;
const PART_LEN: usize = 2;
const VIDEO_ID_LEN: usize = 4;
const STEM_LEN: usize = PREFIX_LEN + PART_LEN + VIDEO_ID_LEN;

const VIDEO_EXTENSIONS: [&str; 2] = ["mp4", "mov"];

/// The pieces of a GoPro chaptered filename such as `GH021447.MP4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipName {
    pub video_id: String,
    pub part: u32,
    pub extension: String,
}

/// A source file that matched the GoPro naming shape. Never written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub video_id: String,
    pub part: u32,
    pub extension: String,
}

/// All parts of one recording, ordered by ascending part number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoGroup {
    pub video_id: String,
    pub parts: Vec<SourceFile>,
}

#[derive(Error, Debug)]
pub enum GroupError {
    #[error(
        "video {video_id} has two files claiming part {part}: {} and {}",
        first.display(),
        second.display()
    )]
    DuplicatePart {
        video_id: String,
        part: u32,
        first: PathBuf,
        second: PathBuf,
    },
}

/// Parses a filename by fixed offsets: 2 letter prefix, 2 digit part, 4 digit video id.
/// Anything else is not a GoPro chapter and yields `None`.
pub fn parse_clip_name(file_name: &str) -> Option<ClipName> {
    let (stem, extension) = file_name.rsplit_once('.')?;
    if !VIDEO_EXTENSIONS
        .iter()
        .any(|known| extension.eq_ignore_ascii_case(known))
    {
        return None;
    }

    let bytes = stem.as_bytes();
    if bytes.len() != STEM_LEN {
        return None;
    }

    let (prefix, rest) = bytes.split_at(PREFIX_LEN);
    let (part, video_id) = rest.split_at(PART_LEN);
    if !prefix.iter().all(u8::is_ascii_alphabetic)
        || !part.iter().all(u8::is_ascii_digit)
        || !video_id.iter().all(u8::is_ascii_digit)
    {
        return None;
    }

    // All bytes checked as ASCII above, so these slices are on char boundaries.
    let part = stem[PREFIX_LEN..PREFIX_LEN + PART_LEN].parse().ok()?;
    let video_id = stem[PREFIX_LEN + PART_LEN..].to_string();

    Some(ClipName {
        video_id,
        part,
        extension: extension.to_string(),
    })
}

/// Lists the regular files directly inside `dir` that look like GoPro chapters.
pub fn scan_directory(dir: &Path) -> io::Result<Vec<SourceFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };

        let Some(clip) = parse_clip_name(name) else {
            log::debug!("Skipping {name}: not a GoPro chapter file");
            continue;
        };

        // Follows symlinks, so a linked chapter counts like a regular one.
        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => continue,
            Err(error) => {
                log::warn!("Skipping {}: {error}", path.display());
                continue;
            }
        }

        files.push(SourceFile {
            path,
            video_id: clip.video_id,
            part: clip.part,
            extension: clip.extension,
        });
    }

    Ok(files)
}

/// Partitions files by video id and orders each group by part number.
pub fn group_files(files: Vec<SourceFile>) -> Result<BTreeMap<String, VideoGroup>, GroupError> {
    let mut groups: BTreeMap<String, VideoGroup> = BTreeMap::new();
    for file in files {
        let video_id = file.video_id.clone();
        groups
            .entry(video_id.clone())
            .or_insert_with(|| VideoGroup {
                video_id,
                parts: Vec::new(),
            })
            .parts
            .push(file);
    }

    for group in groups.values_mut() {
        sort_parts(&mut group.parts);
        if let Some(pair) = group.parts.windows(2).find(|pair| pair[0].part == pair[1].part) {
            return Err(GroupError::DuplicatePart {
                video_id: group.video_id.clone(),
                part: pair[0].part,
                first: pair[0].path.clone(),
                second: pair[1].path.clone(),
            });
        }
    }

    Ok(groups)
}

pub fn sort_parts(parts: &mut [SourceFile]) {
    parts.sort_by(|a, b| a.part.cmp(&b.part));
}

impl VideoGroup {
    pub fn is_single(&self) -> bool {
        self.parts.len() == 1
    }

    /// `{video_id}_{index}.{ext}` for each part, index counted from 1.
    pub fn renamed_targets(&self) -> Vec<(&SourceFile, String)> {
        self.parts
            .iter()
            .enumerate()
            .map(|(index, part)| {
                (
                    part,
                    format!("{}_{}.{}", self.video_id, index + 1, part.extension),
                )
            })
            .collect()
    }

    /// `{video_id}.{ext}`, using the extension of the first part.
    pub fn merged_name(&self) -> String {
        let extension = self
            .parts
            .first()
            .map(|part| part.extension.as_str())
            .unwrap_or("MP4");
        format!("{}.{}", self.video_id, extension)
    }

    pub fn paths(&self) -> Vec<&Path> {
        self.parts.iter().map(|part| part.path.as_path()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str) -> SourceFile {
        let clip = parse_clip_name(name).unwrap();
        SourceFile {
            path: PathBuf::from("/videos").join(name),
            video_id: clip.video_id,
            part: clip.part,
            extension: clip.extension,
        }
    }

    #[test]
    fn parses_fixed_offsets() {
        let clip = parse_clip_name("GH021447.MP4").unwrap();
        assert_eq!(clip.video_id, "1447");
        assert_eq!(clip.part, 2);
        assert_eq!(clip.extension, "MP4");

        let clip = parse_clip_name("GX120001.mp4").unwrap();
        assert_eq!(clip.video_id, "0001");
        assert_eq!(clip.part, 12);
        assert_eq!(clip.extension, "mp4");
    }

    #[test]
    fn rejects_other_shapes() {
        for name in [
            "notes.txt",
            "IMG_0001.JPG",
            "GH011447.JPG",
            "GH01447.MP4",
            "GH0114470.MP4",
            "G1011447.MP4",
            "GHA11447.MP4",
            "GH01144X.MP4",
            "GH011447",
            ".MP4",
            "GOPR1447.MP4",
        ] {
            assert_eq!(parse_clip_name(name), None, "{name} should not parse");
        }
    }

    #[test]
    fn groups_and_sorts_by_part() {
        let files = vec![
            source("GH031449.MP4"),
            source("GH011447.MP4"),
            source("GH011449.MP4"),
            source("GH011440.MP4"),
            source("GH021449.MP4"),
            source("GH021447.MP4"),
        ];

        let groups = group_files(files).unwrap();
        assert_eq!(
            groups.keys().collect::<Vec<_>>(),
            vec!["1440", "1447", "1449"]
        );
        let parts: Vec<u32> = groups["1449"].parts.iter().map(|p| p.part).collect();
        assert_eq!(parts, vec![1, 2, 3]);
        assert!(groups["1440"].is_single());
        assert_eq!(
            groups.values().map(|g| g.parts.len()).sum::<usize>(),
            6,
            "every file lands in exactly one group"
        );
    }

    #[test]
    fn sorts_numerically_not_lexically() {
        let mut parts = vec![
            source("GH101449.MP4"),
            source("GH091449.MP4"),
            source("GH021449.MP4"),
        ];
        sort_parts(&mut parts);
        let order: Vec<u32> = parts.iter().map(|p| p.part).collect();
        assert_eq!(order, vec![2, 9, 10]);
    }

    #[test]
    fn scan_keeps_chapters_and_skips_everything_else() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("GH011447.MP4"), b"a").unwrap();
        fs::write(dir.path().join("notes.txt"), b"b").unwrap();
        fs::create_dir(dir.path().join("GH021447.MP4")).unwrap();

        let files = scan_directory(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].video_id, "1447");
        assert_eq!(files[0].part, 1);
    }

    #[cfg(unix)]
    #[test]
    fn scan_follows_symlinked_chapters() {
        let dir = tempfile::tempdir().unwrap();
        let card = tempfile::tempdir().unwrap();
        let real = card.path().join("GH011450.MP4");
        fs::write(&real, b"chapter").unwrap();
        std::os::unix::fs::symlink(&real, dir.path().join("GH011450.MP4")).unwrap();
        std::os::unix::fs::symlink(
            card.path().join("missing.MP4"),
            dir.path().join("GH021450.MP4"),
        )
        .unwrap();

        let files = scan_directory(dir.path()).unwrap();
        assert_eq!(files.len(), 1, "dangling links are skipped");
        assert_eq!(files[0].video_id, "1450");
        assert_eq!(files[0].path, dir.path().join("GH011450.MP4"));
    }

    #[test]
    fn duplicate_part_is_rejected() {
        let files = vec![source("GH011447.MP4"), source("GX011447.MP4")];
        let err = group_files(files).unwrap_err();
        match err {
            GroupError::DuplicatePart { video_id, part, .. } => {
                assert_eq!(video_id, "1447");
                assert_eq!(part, 1);
            }
        }
    }

    #[test]
    fn target_names() {
        let groups = group_files(vec![source("GH021449.MP4"), source("GH011449.MP4")]).unwrap();
        let group = &groups["1449"];
        let names: Vec<String> = group
            .renamed_targets()
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        assert_eq!(names, vec!["1449_1.MP4", "1449_2.MP4"]);
        assert_eq!(group.merged_name(), "1449.MP4");
    }
}
