//! Known-face gallery.
//!
//! Loaded once from `students_dir` and read-only afterwards; the pipeline
//! shares it across runs behind an `Arc`.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

use crate::detect::registry::VisionBackends;
use crate::detect::result::{BoundingBox, Embedding, RecognitionMatch, UNKNOWN_IDENTITY};
use crate::frame::Image;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Clone, Debug)]
pub struct GalleryEntry {
    pub name: String,
    pub embedding: Embedding,
}

#[derive(Clone, Debug, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, embedding: Embedding) {
        self.entries.push(GalleryEntry {
            name: name.into(),
            embedding,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Entry with the highest cosine similarity to `embedding`.
    ///
    /// The match is accepted only when similarity is strictly greater than
    /// `threshold`; otherwise the identity is `unknown` with the best score seen.
    pub fn best_match(
        &self,
        embedding: &[f32],
        threshold: f32,
        bbox: BoundingBox,
    ) -> RecognitionMatch {
        let mut best: Option<(&GalleryEntry, f32)> = None;
        for entry in &self.entries {
            let similarity = cosine_similarity(embedding, &entry.embedding);
            if best.map_or(true, |(_, s)| similarity > s) {
                best = Some((entry, similarity));
            }
        }

        match best {
            Some((entry, similarity)) if similarity > threshold => RecognitionMatch {
                identity: entry.name.clone(),
                similarity,
                bbox,
            },
            Some((_, similarity)) => RecognitionMatch {
                identity: UNKNOWN_IDENTITY.to_string(),
                similarity,
                bbox,
            },
            None => RecognitionMatch {
                identity: UNKNOWN_IDENTITY.to_string(),
                similarity: 0.0,
                bbox,
            },
        }
    }

    /// Build a gallery from a directory of portrait images.
    ///
    /// Each image is decoded, the largest detected face is embedded, and the
    /// file stem becomes the identity (`jane_doe.jpg` → "Jane Doe"). Images that
    /// fail to decode or contain no face are skipped with a warning.
    pub fn load_dir(dir: &Path, backends: &mut VisionBackends) -> Result<Self> {
        let listing = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read students_dir {}", dir.display()))?;

        let mut paths: Vec<_> = listing
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut gallery = Gallery::new();
        for path in paths {
            let Some(name) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(identity_from_stem)
            else {
                continue;
            };
            match embed_portrait(&path, backends) {
                Ok(embedding) => {
                    log::info!("gallery: loaded face for {}", name);
                    gallery.insert(name, embedding);
                }
                Err(e) => log::warn!("gallery: skipping {}: {:#}", path.display(), e),
            }
        }

        log::info!(
            "gallery: {} known faces from {}",
            gallery.len(),
            dir.display()
        );
        Ok(gallery)
    }
}

fn embed_portrait(path: &Path, backends: &mut VisionBackends) -> Result<Embedding> {
    let decoded = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8();
    let (width, height) = decoded.dimensions();
    let portrait = Image::from_rgb(width, height, decoded.into_raw())?;

    let face = backends
        .detect(&portrait)?
        .into_iter()
        .filter(|d| d.is_face())
        .max_by_key(|d| d.bbox.area())
        .ok_or_else(|| anyhow!("no face detected"))?;
    let crop = portrait
        .crop(&face.bbox)
        .ok_or_else(|| anyhow!("face box outside image"))?;
    Ok(backends.embed(&crop)?)
}

/// `jane_doe` / `jane-doe` / `JANE DOE` → `Jane Doe`.
pub fn identity_from_stem(stem: &str) -> String {
    stem.split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cosine similarity of two vectors. Zero when either is all zeros or the
/// lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::stub::{BACKGROUND_COLOR, EYE_COLOR, FACE_COLOR};

    fn bbox() -> BoundingBox {
        BoundingBox::new(0, 0, 10, 10)
    }

    #[test]
    fn cosine_similarity_edge_cases() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn best_match_requires_strictly_greater_than_threshold() {
        let mut gallery = Gallery::new();
        gallery.insert("Ada Lovelace", vec![1.0, 0.0]);
        gallery.insert("Alan Turing", vec![0.0, 1.0]);

        let hit = gallery.best_match(&[0.9, 0.1], 0.7, bbox());
        assert_eq!(hit.identity, "Ada Lovelace");
        assert!(hit.is_known());

        // cos(45°) ≈ 0.707: below a 0.8 threshold.
        let miss = gallery.best_match(&[1.0, 1.0], 0.8, bbox());
        assert_eq!(miss.identity, UNKNOWN_IDENTITY);
        assert!(miss.similarity > 0.7);

        let exact = gallery.best_match(&[1.0, 0.0], 1.0, bbox());
        assert_eq!(exact.identity, UNKNOWN_IDENTITY);
    }

    #[test]
    fn empty_gallery_reports_unknown() {
        let m = Gallery::new().best_match(&[1.0], 0.5, bbox());
        assert_eq!(m.identity, UNKNOWN_IDENTITY);
        assert_eq!(m.similarity, 0.0);
    }

    #[test]
    fn identity_names_are_title_cased() {
        assert_eq!(identity_from_stem("jane_doe"), "Jane Doe");
        assert_eq!(identity_from_stem("JEAN-LUC  picard"), "Jean Luc Picard");
    }

    #[test]
    fn load_dir_embeds_portraits_and_skips_faceless_images() {
        let dir = tempfile::tempdir().unwrap();

        let mut portrait = image::RgbImage::from_pixel(60, 60, image::Rgb(BACKGROUND_COLOR));
        for y in 10..50 {
            for x in 10..50 {
                portrait.put_pixel(x, y, image::Rgb(FACE_COLOR));
            }
        }
        for y in 20..24 {
            for x in 18..24 {
                portrait.put_pixel(x, y, image::Rgb(EYE_COLOR));
            }
        }
        portrait.save(dir.path().join("grace_hopper.png")).unwrap();

        let blank = image::RgbImage::from_pixel(20, 20, image::Rgb(BACKGROUND_COLOR));
        blank.save(dir.path().join("nobody.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut backends = VisionBackends::stub();
        let gallery = Gallery::load_dir(dir.path(), &mut backends).unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.names().collect::<Vec<_>>(), vec!["Grace Hopper"]);
    }

    #[test]
    fn load_dir_fails_for_missing_directory() {
        let mut backends = VisionBackends::stub();
        assert!(Gallery::load_dir(Path::new("/definitely/not/here"), &mut backends).is_err());
    }
}
