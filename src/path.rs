/// Recorded toolpaths and the numbered path-file format
///
/// One point per line: `x,y,draw_flag`, coordinates normalized to the work
/// area with four decimals, flag `0` or `1`. Files live in a paths directory
/// as `<id>.txt`.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path as FsPath, PathBuf};

/// One recorded point. `draw` means material is deposited while moving here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathPoint {
    pub x: f64,
    pub y: f64,
    pub draw: bool,
}

impl PathPoint {
    pub fn new(x: f64, y: f64, draw: bool) -> Self {
        Self { x, y, draw }
    }
}

/// Ordered, read-only sequence of points. Insertion order is traversal order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Path {
    points: Vec<PathPoint>,
}

impl Path {
    pub fn new(points: Vec<PathPoint>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[PathPoint] {
        &self.points
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PathPoint> {
        self.points.iter()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Keep every `step`-th point starting at the first. A step of 0 or 1
    /// keeps the path unchanged.
    pub fn every_nth(&self, step: usize) -> Path {
        Path::new(self.points.iter().step_by(step.max(1)).copied().collect())
    }

    pub fn draw_point_count(&self) -> usize {
        self.points.iter().filter(|p| p.draw).count()
    }
}

impl From<Vec<PathPoint>> for Path {
    fn from(points: Vec<PathPoint>) -> Self {
        Self::new(points)
    }
}

impl<'a> IntoIterator for &'a Path {
    type Item = &'a PathPoint;
    type IntoIter = std::slice::Iter<'a, PathPoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

/// Location of path `id` inside `dir`
pub fn path_file(dir: &FsPath, id: u32) -> PathBuf {
    dir.join(format!("{}.txt", id))
}

fn parse_line(line: &str) -> Option<PathPoint> {
    let mut fields = line.split(',').map(str::trim);
    let x = fields.next()?.parse::<f64>().ok()?;
    let y = fields.next()?.parse::<f64>().ok()?;
    let flag = fields.next()?.parse::<i64>().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(PathPoint::new(x, y, flag != 0))
}

/// Parse path-file text. Blank lines are skipped; malformed lines are
/// skipped with a warning and never abort the load.
pub fn parse_path(text: &str) -> Path {
    let mut points = Vec::new();
    for (line_no, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(point) => points.push(point),
            None => warn!(target: "path", "Skipping malformed path line {}: {:?}", line_no + 1, line),
        }
    }
    Path::new(points)
}

/// Load path `id` from `dir`. A missing or unreadable file yields an empty path.
pub fn load_path(dir: &FsPath, id: u32) -> Path {
    let file = path_file(dir, id);
    match fs::read_to_string(&file) {
        Ok(text) => {
            let path = parse_path(&text);
            info!(target: "path", "Loaded {} points ({} draw) from {}",
                  path.len(), path.draw_point_count(), file.display());
            path
        }
        Err(e) => {
            warn!(target: "path", "Could not open path file {}: {}", file.display(), e);
            Path::default()
        }
    }
}

/// Render a path in the capture-tool format
pub fn format_path(path: &Path) -> String {
    let mut out = String::with_capacity(path.len() * 16);
    for p in path {
        out.push_str(&format!("{:.4},{:.4},{}\n", p.x, p.y, u8::from(p.draw)));
    }
    out
}

/// Next unused identifier in `dir` (0 for an empty or missing directory)
pub fn next_path_id(dir: &FsPath) -> Result<u32> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut max_id: Option<u32> = None;
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let entry = entry?;
        let name = entry.path();
        if name.extension().and_then(|e| e.to_str()) != Some("txt") {
            continue;
        }
        if let Some(id) = name.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse::<u32>().ok()) {
            max_id = Some(max_id.map_or(id, |m| m.max(id)));
        }
    }
    Ok(max_id.map_or(0, |m| m + 1))
}

/// Write `path` under the next free number in `dir`, creating the directory.
pub fn save_path(dir: &FsPath, path: &Path) -> Result<u32> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let id = next_path_id(dir)?;
    let file = path_file(dir, id);
    fs::write(&file, format_path(path)).with_context(|| format!("Failed to write {}", file.display()))?;
    debug!(target: "path", "Saved {} points to {}", path.len(), file.display());
    Ok(id)
}
