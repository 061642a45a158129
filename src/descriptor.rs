//! Identity and naming of files living on the peer.
//!
//! A [`FileDescriptor`] is obtained from a directory listing, a file-list page
//! or a peer announcement and never changes afterwards. Besides identifying
//! the remote file it decides where a download lands locally:
//!
//! ```text
//! [KIND]/[YEAR]/[KIND]_[yyyy-MM-dd_HH-mm-ss]_[INDEX].[fit|bin]
//! ```
//!
//! Two older layouts are still recognised when checking whether a file was
//! already retrieved, see [`FileDescriptor::legacy_file_names`].

use std::fmt::Display;
use std::path::PathBuf;

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::reader::ByteReader;
use crate::Result;

/// Seconds between the unix epoch and the device epoch (1989-12-31).
pub const DEVICE_EPOCH_OFFSET: i64 = 631_065_600;

pub const FLAG_ARCHIVED: u8 = 0x10;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const FIT_DATA_TYPE: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Directory,
    Activity,
    Monitor,
    Metrics,
    Changelog,
    HrvStatus,
    Sleep,
    SkinTemp,
    Ecg,
    Settings,
    Workout,
    Course,
    DeviceXml,
}

impl FileKind {
    const TABLE: [(FileKind, u8, u8); 13] = [
        (FileKind::Directory, 0, 0),
        (FileKind::Activity, FIT_DATA_TYPE, 4),
        (FileKind::Monitor, FIT_DATA_TYPE, 32),
        (FileKind::Metrics, FIT_DATA_TYPE, 44),
        (FileKind::Changelog, FIT_DATA_TYPE, 41),
        (FileKind::HrvStatus, FIT_DATA_TYPE, 68),
        (FileKind::Sleep, FIT_DATA_TYPE, 49),
        (FileKind::SkinTemp, FIT_DATA_TYPE, 73),
        (FileKind::Ecg, FIT_DATA_TYPE, 61),
        (FileKind::Settings, FIT_DATA_TYPE, 2),
        (FileKind::Workout, FIT_DATA_TYPE, 5),
        (FileKind::Course, FIT_DATA_TYPE, 6),
        (FileKind::DeviceXml, 8, 255),
    ];

    pub fn from_type(data_type: u8, sub_type: u8) -> Option<FileKind> {
        Self::TABLE
            .iter()
            .find(|(_, dt, st)| *dt == data_type && *st == sub_type)
            .map(|(kind, _, _)| *kind)
    }

    pub fn type_codes(&self) -> (u8, u8) {
        Self::TABLE
            .iter()
            .find(|(kind, _, _)| kind == self)
            .map(|(_, dt, st)| (*dt, *st))
            .unwrap_or((0, 0))
    }

    /// Kinds fetched without the "also fetch unknown" override.
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            FileKind::Directory
                | FileKind::Activity
                | FileKind::Monitor
                | FileKind::Metrics
                | FileKind::Changelog
                | FileKind::HrvStatus
                | FileKind::Sleep
                | FileKind::SkinTemp
                | FileKind::Ecg
        )
    }

    /// Content is a structured record file rather than an opaque blob.
    pub fn is_fit(&self) -> bool {
        self.type_codes().0 == FIT_DATA_TYPE
    }

    pub fn extension(&self) -> &'static str {
        if self.is_fit() {
            "fit"
        } else {
            "bin"
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileKind::Directory => "DIRECTORY",
            FileKind::Activity => "ACTIVITY",
            FileKind::Monitor => "MONITOR",
            FileKind::Metrics => "METRICS",
            FileKind::Changelog => "CHANGELOG",
            FileKind::HrvStatus => "HRV_STATUS",
            FileKind::Sleep => "SLEEP",
            FileKind::SkinTemp => "SKIN_TEMP",
            FileKind::Ecg => "ECG",
            FileKind::Settings => "SETTINGS",
            FileKind::Workout => "WORKOUT",
            FileKind::Course => "COURSE",
            FileKind::DeviceXml => "DEVICE_XML",
        }
    }
}

impl Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Remote identifier of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileHandle {
    /// Directory-listing index.
    Index(u16),
    /// Identifier pair used by the file-list sync service.
    Composite { major: u32, minor: u32 },
}

impl FileHandle {
    const TAG_INDEX: u8 = 0x00;
    const TAG_COMPOSITE: u8 = 0x01;

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            FileHandle::Index(index) => {
                buf.push(Self::TAG_INDEX);
                buf.extend_from_slice(&index.to_le_bytes());
            }
            FileHandle::Composite { major, minor } => {
                buf.push(Self::TAG_COMPOSITE);
                buf.extend_from_slice(&major.to_le_bytes());
                buf.extend_from_slice(&minor.to_le_bytes());
            }
        }
    }

    pub(crate) fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        match reader.u8()? {
            Self::TAG_INDEX => Ok(FileHandle::Index(reader.u16()?)),
            Self::TAG_COMPOSITE => Ok(FileHandle::Composite {
                major: reader.u32()?,
                minor: reader.u32()?,
            }),
            tag => Err(crate::TransferError::malformed(format!(
                "unknown handle tag {:#04x}",
                tag
            ))),
        }
    }
}

impl Display for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileHandle::Index(index) => write!(f, "{}", index),
            FileHandle::Composite { major, minor } => {
                write!(f, "{}-{}", major, minor)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub handle: FileHandle,
    pub kind: FileKind,
    /// Size declared by the listing; the transfer adopts the peer's value.
    pub size: u32,
    pub modified: Option<DateTime<Utc>>,
    pub flags: u8,
}

impl FileDescriptor {
    pub fn new(handle: FileHandle, kind: FileKind, size: u32) -> Self {
        Self {
            handle,
            kind,
            size,
            modified: None,
            flags: 0,
        }
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// The root listing every directory-based sync starts from.
    pub fn root_directory() -> Self {
        Self::new(FileHandle::Index(0), FileKind::Directory, 0)
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_archived(&self) -> bool {
        self.flags & FLAG_ARCHIVED != 0
    }

    /// `[KIND]_[timestamp]_[INDEX].[ext]`, timestamp omitted when unknown.
    pub fn file_name(&self) -> String {
        let mut name = self.kind.name().to_owned();
        if let Some(modified) = self.modified {
            name.push('_');
            name.push_str(&modified.format(TIMESTAMP_FORMAT).to_string());
        }
        name.push_str(&format!("_{}.{}", self.handle, self.kind.extension()));
        name
    }

    /// Path relative to the export root.
    pub fn output_path(&self) -> PathBuf {
        let mut path = PathBuf::from(self.kind.name());
        if let Some(modified) = self.modified {
            path.push(modified.format("%Y").to_string());
        }
        path.push(self.file_name());
        path
    }

    /// Names written by earlier releases, oldest last, in local time.
    ///
    /// See [`legacy_file_names_in`](Self::legacy_file_names_in).
    pub fn legacy_file_names(&self) -> Vec<PathBuf> {
        self.legacy_file_names_in(&Local)
    }

    /// Names written by earlier releases, which formatted timestamps in the
    /// phone's zone rather than UTC.
    ///
    /// Both sat at the export root. The first is the current naming with the
    /// timestamp dropped for an undated file. The second put the index before
    /// the timestamp and stamped undated files with the device epoch. Only
    /// directory-listing handles ever used these layouts.
    pub fn legacy_file_names_in<Tz>(&self, zone: &Tz) -> Vec<PathBuf>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        if !matches!(self.handle, FileHandle::Index(_)) {
            return vec![];
        }
        let stamp = |at: DateTime<Utc>| {
            at.with_timezone(zone).format(TIMESTAMP_FORMAT).to_string()
        };
        let (kind, extension) = (self.kind.name(), self.kind.extension());

        let mut first = kind.to_owned();
        if let Some(modified) = self.modified {
            first.push('_');
            first.push_str(&stamp(modified));
        }
        first.push_str(&format!("_{}.{}", self.handle, extension));
        let mut names = vec![PathBuf::from(first)];

        if let Some(at) = self.modified.or_else(device_epoch_start) {
            names.push(PathBuf::from(format!(
                "{}_{}_{}.{}",
                kind,
                self.handle,
                stamp(at),
                extension
            )));
        }
        names
    }
}

impl Display for FileDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{} ({} bytes)", self.kind, self.handle, self.size)
    }
}

fn device_epoch_start() -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(DEVICE_EPOCH_OFFSET, 0).single()
}

/// Convert a device timestamp; zero means "no date".
pub fn from_device_timestamp(raw: u32) -> Option<DateTime<Utc>> {
    if raw == 0 {
        return None;
    }
    Utc.timestamp_opt(DEVICE_EPOCH_OFFSET + i64::from(raw), 0)
        .single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use rstest::rstest;

    fn activity() -> FileDescriptor {
        FileDescriptor::new(FileHandle::Index(12), FileKind::Activity, 4096)
            .with_modified(Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap())
    }

    #[test]
    fn canonical_output_path() {
        assert_eq!(
            activity().output_path(),
            PathBuf::from("ACTIVITY/2024/ACTIVITY_2024-03-05_07-08-09_12.fit")
        );
    }

    #[test]
    fn undated_files_skip_year_folder() {
        let entry =
            FileDescriptor::new(FileHandle::Index(3), FileKind::DeviceXml, 10);
        assert_eq!(entry.output_path(), PathBuf::from("DEVICE_XML/DEVICE_XML_3.bin"));
    }

    #[test]
    fn legacy_names() {
        let names = activity().legacy_file_names_in(&Utc);
        assert_eq!(
            names,
            vec![
                PathBuf::from("ACTIVITY_2024-03-05_07-08-09_12.fit"),
                PathBuf::from("ACTIVITY_12_2024-03-05_07-08-09.fit"),
            ]
        );
    }

    #[test]
    fn legacy_names_use_the_phone_zone() {
        let zone = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(
            activity().legacy_file_names_in(&zone),
            vec![
                PathBuf::from("ACTIVITY_2024-03-05_09-08-09_12.fit"),
                PathBuf::from("ACTIVITY_12_2024-03-05_09-08-09.fit"),
            ]
        );
        // the current layout stays in UTC
        assert_eq!(activity().file_name(), "ACTIVITY_2024-03-05_07-08-09_12.fit");

        let west = FixedOffset::west_opt(5 * 3600).unwrap();
        assert_eq!(
            activity().legacy_file_names()[1],
            activity().legacy_file_names_in(&Local)[1]
        );
        assert_eq!(
            activity().legacy_file_names_in(&west)[1],
            PathBuf::from("ACTIVITY_12_2024-03-05_02-08-09.fit")
        );
    }

    #[test]
    fn undated_legacy_name_carries_the_device_epoch() {
        let entry =
            FileDescriptor::new(FileHandle::Index(4), FileKind::Monitor, 10);
        assert_eq!(
            entry.legacy_file_names_in(&Utc),
            vec![
                PathBuf::from("MONITOR_4.fit"),
                PathBuf::from("MONITOR_4_1989-12-31_00-00-00.fit"),
            ]
        );
        let zone = FixedOffset::east_opt(3600).unwrap();
        assert_eq!(
            entry.legacy_file_names_in(&zone)[1],
            PathBuf::from("MONITOR_4_1989-12-31_01-00-00.fit")
        );
    }

    #[test]
    fn composite_handles_have_no_legacy_names() {
        let entry = FileDescriptor::new(
            FileHandle::Composite { major: 7, minor: 9 },
            FileKind::Sleep,
            10,
        );
        assert!(entry.legacy_file_names().is_empty());
        assert_eq!(entry.file_name(), "SLEEP_7-9.fit");
    }

    #[rstest]
    #[case(0, 0, Some(FileKind::Directory))]
    #[case(128, 4, Some(FileKind::Activity))]
    #[case(128, 73, Some(FileKind::SkinTemp))]
    #[case(8, 255, Some(FileKind::DeviceXml))]
    #[case(128, 200, None)]
    fn kind_lookup(
        #[case] data_type: u8,
        #[case] sub_type: u8,
        #[case] expected: Option<FileKind>,
    ) {
        assert_eq!(FileKind::from_type(data_type, sub_type), expected);
        if let Some(kind) = expected {
            assert_eq!(kind.type_codes(), (data_type, sub_type));
        }
    }

    #[test]
    fn device_epoch() {
        assert_eq!(from_device_timestamp(0), None);
        let date = from_device_timestamp(1).unwrap();
        assert_eq!(date.timestamp(), DEVICE_EPOCH_OFFSET + 1);
    }

    #[test]
    fn handle_wire_encoding() {
        let mut buf = vec![];
        FileHandle::Composite { major: 1, minor: 2 }.encode_into(&mut buf);
        FileHandle::Index(0x0102).encode_into(&mut buf);
        let mut reader = ByteReader::new(&buf);
        assert_eq!(
            FileHandle::decode(&mut reader).unwrap(),
            FileHandle::Composite { major: 1, minor: 2 }
        );
        assert_eq!(
            FileHandle::decode(&mut reader).unwrap(),
            FileHandle::Index(0x0102)
        );
    }
}
