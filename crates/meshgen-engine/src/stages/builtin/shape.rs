use anyhow::{ensure, Context};
use image::RgbaImage;
use meshgen_types::{Mesh, ViewName};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::GIB;
use crate::stages::{ImageTo3D, ShapeParams, Stage, ViewSet};

const ALPHA_THRESHOLD: u8 = 128;
const MIN_CELLS: u32 = 8;
const MAX_CELLS: u32 = 128;
const BASE_DEPTH: f32 = 0.35;
const JITTER: f32 = 0.01;
const ROUNDS_PER_STEP: usize = 4;

/// Lifts the primary view's silhouette into a closed two-sided relief.
///
/// The alpha mask is sampled on a grid derived from the octree resolution
/// and inflated by masked diffusion, so the surface bulges towards the
/// middle of the silhouette and meets its mirror at the outline.
#[derive(Debug, Clone)]
pub struct SilhouetteLifter {
    model: String,
    compiled: bool,
}

impl SilhouetteLifter {
    pub fn new(model: impl Into<String>, compiled: bool) -> Self {
        Self {
            model: model.into(),
            compiled,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }
}

impl Stage for SilhouetteLifter {
    fn name(&self) -> &'static str {
        "silhouette lifter"
    }

    fn footprint_bytes(&self) -> u64 {
        5 * GIB
    }
}

impl ImageTo3D for SilhouetteLifter {
    fn generate(&self, views: &ViewSet, params: &ShapeParams) -> anyhow::Result<Mesh> {
        let (_, primary) = views.primary().context("no input view supplied")?;
        ensure!(primary.width() > 1 && primary.height() > 1, "input view is too small");

        let cells = (params.octree_resolution / 4).clamp(MIN_CELLS, MAX_CELLS) as usize;
        let grid = SampleGrid::from_mask(primary, cells);
        ensure!(grid.inside.iter().any(|&v| v), "no foreground found in the input image");

        let side = views.get(ViewName::Left).or_else(|| views.get(ViewName::Right));
        let depth_scale = side.map_or(1.0, |img| 0.5 + silhouette_coverage(img));
        let guidance = params.guidance_scale.max(0.0);
        let depth = BASE_DEPTH * depth_scale * (0.5 + 0.5 * guidance / (guidance + 1.0));

        let heights = grid.inflate(params.steps as usize * ROUNDS_PER_STEP);
        let mesh = grid.build_relief(&heights, depth, params.seed, params.num_chunks.max(1) as usize);
        ensure!(!mesh.faces.is_empty(), "foreground is too thin to form a surface");
        Ok(mesh)
    }
}

struct SampleGrid {
    cells: usize,
    /// `(cells + 1)^2` vertex samples, row-major from the top.
    inside: Vec<bool>,
    scale_x: f32,
    scale_y: f32,
}

impl SampleGrid {
    fn from_mask(image: &RgbaImage, cells: usize) -> Self {
        let (w, h) = image.dimensions();
        let n = cells + 1;
        let mut inside = Vec::with_capacity(n * n);
        for j in 0..n {
            let y = ((j as f32 / cells as f32) * (h - 1) as f32).round() as u32;
            for i in 0..n {
                let x = ((i as f32 / cells as f32) * (w - 1) as f32).round() as u32;
                inside.push(image.get_pixel(x, y)[3] >= ALPHA_THRESHOLD);
            }
        }
        let longest = w.max(h) as f32;
        Self {
            cells,
            inside,
            scale_x: w as f32 / longest,
            scale_y: h as f32 / longest,
        }
    }

    fn side(&self) -> usize {
        self.cells + 1
    }

    fn at(&self, i: isize, j: isize) -> Option<usize> {
        let n = self.side() as isize;
        (i >= 0 && j >= 0 && i < n && j < n).then(|| (j * n + i) as usize)
    }

    fn is_boundary(&self, k: usize) -> bool {
        let n = self.side() as isize;
        let (i, j) = ((k as isize) % n, (k as isize) / n);
        [(-1, 0), (1, 0), (0, -1), (0, 1)]
            .iter()
            .any(|(di, dj)| self.at(i + di, j + dj).map_or(true, |nk| !self.inside[nk]))
    }

    /// Jacobi iterations of a masked Poisson problem; zero outside the mask.
    fn inflate(&self, rounds: usize) -> Vec<f32> {
        let n = self.side();
        let source = 1.0 / n as f32;
        let mut heights = vec![0.0f32; n * n];
        for _ in 0..rounds.max(1) {
            let mut next = vec![0.0f32; n * n];
            for (k, slot) in next.iter_mut().enumerate() {
                if !self.inside[k] {
                    continue;
                }
                let (i, j) = ((k % n) as isize, (k / n) as isize);
                let sum: f32 = [(-1, 0), (1, 0), (0, -1), (0, 1)]
                    .iter()
                    .map(|(di, dj)| self.at(i + di, j + dj).map_or(0.0, |nk| heights[nk]))
                    .sum();
                *slot = sum / 4.0 + source;
            }
            heights = next;
        }
        heights
    }

    fn position(&self, k: usize, z: f32) -> [f32; 3] {
        let n = self.side();
        let (i, j) = (k % n, k / n);
        [
            (i as f32 / self.cells as f32 - 0.5) * self.scale_x,
            (0.5 - j as f32 / self.cells as f32) * self.scale_y,
            z,
        ]
    }

    fn build_relief(&self, heights: &[f32], depth: f32, seed: u64, chunk: usize) -> Mesh {
        let n = self.side();
        let peak = heights.iter().cloned().fold(0.0f32, f32::max).max(f32::EPSILON);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut front = vec![u32::MAX; n * n];
        let mut back = vec![u32::MAX; n * n];
        let mut vertices = Vec::new();

        let samples: Vec<usize> = (0..n * n).filter(|&k| self.inside[k]).collect();
        for batch in samples.chunks(chunk) {
            for &k in batch {
                if self.is_boundary(k) {
                    let idx = vertices.len() as u32;
                    vertices.push(self.position(k, 0.0));
                    front[k] = idx;
                    back[k] = idx;
                } else {
                    let jitter = rng.gen_range(-1.0f32..1.0) * JITTER * depth;
                    let z = ((heights[k] / peak).sqrt() * depth + jitter).max(depth * 0.01);
                    front[k] = vertices.len() as u32;
                    vertices.push(self.position(k, z));
                    back[k] = vertices.len() as u32;
                    vertices.push(self.position(k, -z));
                }
            }
        }

        let mut faces = Vec::new();
        for j in 0..self.cells {
            for i in 0..self.cells {
                // Counter-clockwise seen from +z: top-left, bottom-left, bottom-right, top-right.
                let ring = [j * n + i, (j + 1) * n + i, (j + 1) * n + i + 1, j * n + i + 1];
                let present: Vec<usize> = ring.iter().copied().filter(|&k| self.inside[k]).collect();
                match present.len() {
                    4 => {
                        push_pair(&mut faces, &front, &back, [ring[0], ring[1], ring[2]]);
                        push_pair(&mut faces, &front, &back, [ring[0], ring[2], ring[3]]);
                    }
                    3 => push_pair(&mut faces, &front, &back, [present[0], present[1], present[2]]),
                    _ => {}
                }
            }
        }

        Mesh::new(vertices, faces)
    }
}

fn push_pair(faces: &mut Vec<[u32; 3]>, front: &[u32], back: &[u32], tri: [usize; 3]) {
    faces.push([front[tri[0]], front[tri[1]], front[tri[2]]]);
    faces.push([back[tri[0]], back[tri[2]], back[tri[1]]]);
}

/// Fraction of image columns containing any foreground.
fn silhouette_coverage(image: &RgbaImage) -> f32 {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }
    let covered = (0..w)
        .filter(|&x| (0..h).any(|y| image.get_pixel(x, y)[3] >= ALPHA_THRESHOLD))
        .count();
    covered as f32 / w as f32
}
