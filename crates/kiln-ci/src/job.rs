//! Job names and the artifacts nodes hand to their dependents.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Nodes of the release pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobName {
    Test,
    Containerize,
    BuildLinux,
    BuildWindows,
    Release,
}

impl JobName {
    pub const ALL: [JobName; 5] = [
        JobName::Test,
        JobName::Containerize,
        JobName::BuildLinux,
        JobName::BuildWindows,
        JobName::Release,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JobName::Test => "test",
            JobName::Containerize => "containerize",
            JobName::BuildLinux => "build-linux",
            JobName::BuildWindows => "build-windows",
            JobName::Release => "release",
        }
    }

    /// Platform built by this node, for the wheel-building nodes.
    pub fn platform(&self) -> Option<Platform> {
        match self {
            JobName::BuildLinux => Some(Platform::Linux),
            JobName::BuildWindows => Some(Platform::Windows),
            _ => None,
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobName::ALL
            .into_iter()
            .find(|job| job.name() == s)
            .ok_or_else(|| format!("unknown job '{s}'"))
    }
}

/// Wheel target platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Windows => "windows",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A platform-tagged wheel file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelArtifact {
    pub file_name: String,
    pub path: PathBuf,
    pub platform: Platform,
    pub size: u64,
    pub sha256: String,
}

/// A container image reference, optionally pinned to a digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
    /// `sha256:...` manifest digest.
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// `repository:tag`
    pub fn tagged(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// `repository@digest` when pinned, otherwise `repository:tag`.
    pub fn pinned(&self) -> String {
        match &self.digest {
            Some(digest) => format!("{}@{}", self.repository, digest),
            None => self.tagged(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tagged())?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Named outputs of a completed node. Never mutated after the node finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub wheels: Vec<WheelArtifact>,
    pub image: Option<ImageRef>,
}

impl ArtifactSet {
    pub fn with_wheels(wheels: Vec<WheelArtifact>) -> Self {
        Self {
            wheels,
            image: None,
        }
    }

    pub fn with_image(image: ImageRef) -> Self {
        Self {
            wheels: Vec::new(),
            image: Some(image),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.wheels.is_empty() && self.image.is_none()
    }

    /// Wheels grouped by platform.
    pub fn wheels_by_platform(&self) -> BTreeMap<Platform, Vec<&WheelArtifact>> {
        let mut grouped: BTreeMap<Platform, Vec<&WheelArtifact>> = BTreeMap::new();
        for wheel in &self.wheels {
            grouped.entry(wheel.platform).or_default().push(wheel);
        }
        grouped
    }
}

/// Find `*.whl` files directly inside `dir`, sorted by name.
///
/// A missing directory yields no wheels.
pub fn discover_wheels(dir: &Path, platform: Platform) -> std::io::Result<Vec<WheelArtifact>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut wheels = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("whl") || !path.is_file() {
            continue;
        }
        let (size, sha256) = hash_file(&path)?;
        wheels.push(WheelArtifact {
            file_name: entry.file_name().to_string_lossy().into_owned(),
            path,
            platform,
            size,
            sha256,
        });
    }
    wheels.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(wheels)
}

fn hash_file(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}
