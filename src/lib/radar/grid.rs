use log::{debug, info};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

pub const NUM_ANGLE_BINS: usize = 64;
pub const NUM_RANGE_BINS: usize = 256;
/// Angle bins left after the first (edge) bin is cut from the shifted spectrum
pub const ANGLE_SAMPLES: usize = NUM_ANGLE_BINS - 1;
/// Meters per range bin
pub const RANGE_RESOLUTION: f64 = 0.0436;

/// The Cartesian grid is GRID_SIZE x GRID_SIZE points
pub const GRID_SIZE: usize = 200;
pub const GRID_POINTS: usize = GRID_SIZE * GRID_SIZE;

// Only query points in this window are located in the triangulation, the
// rest never gets a strength.
const LOCATE_MAX_ABS_X: f64 = 5.0;
const LOCATE_MIN_Y: f64 = 0.5;
const LOCATE_MAX_Y: f64 = 10.5;

const EPS: f64 = 1e-12;
const BUCKETS: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }
}

#[derive(Clone, Copy, Debug)]
struct Bounds {
    min_x: f64,
    max_x: f64,
    min_y: f64,
    max_y: f64,
}

impl Bounds {
    fn of_triangle(vertices: &[Point], triangle: &[usize; 3]) -> Self {
        let [a, b, c] = triangle.map(|v| vertices[v]);
        Bounds {
            min_x: a.x.min(b.x).min(c.x) - EPS,
            max_x: a.x.max(b.x).max(c.x) + EPS,
            min_y: a.y.min(b.y).min(c.y) - EPS,
            max_y: a.y.max(b.y).max(c.y) + EPS,
        }
    }

    fn contains(&self, p: Point) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }
}

/// The regular Cartesian grid the heatmap is interpolated onto. Points are
/// ordered X major: point `i * GRID_SIZE + j` is `(xs[i], ys[j])`.
#[derive(Clone, Debug)]
pub struct QueryGrid {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl QueryGrid {
    pub fn new() -> Self {
        let extent = (max_range()).ceil();
        QueryGrid {
            xs: linspace(-extent, extent, GRID_SIZE),
            ys: linspace(0., extent, GRID_SIZE),
        }
    }

    pub fn len(&self) -> usize {
        self.xs.len() * self.ys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    pub fn index(&self, i: usize, j: usize) -> usize {
        i * self.ys.len() + j
    }

    pub fn point(&self, k: usize) -> Point {
        let n = self.ys.len();
        Point::new(self.xs[k / n], self.ys[k % n])
    }

    pub fn points(&self) -> impl Iterator<Item = Point> + '_ {
        (0..self.len()).map(|k| self.point(k))
    }

    /// Distance between neighbouring grid points in X and Y
    pub fn step(&self) -> (f64, f64) {
        ((self.xs[1] - self.xs[0]).abs(), (self.ys[1] - self.ys[0]).abs())
    }
}

impl Default for QueryGrid {
    fn default() -> Self {
        Self::new()
    }
}

fn max_range() -> f64 {
    (NUM_RANGE_BINS - 1) as f64 * RANGE_RESOLUTION
}

fn linspace(from: f64, to: f64, n: usize) -> Vec<f64> {
    let step = (to - from) / (n - 1) as f64;
    (0..n).map(|i| from + step * i as f64).collect()
}

///
/// Everything about the heatmap geometry that does not change between
/// packets: the range and angle of each heatmap sample, the query grid, a
/// Delaunay triangulation of the sample positions and, for every query
/// point, the triangle that contains it.
///
/// Building this takes a noticeable fraction of a second, so there is one
/// per process, see [`shared`]. Only the sample strengths vary per packet.
///
/// All range 0 samples sit at the origin; they share a single vertex.
///
pub struct GridContext {
    ranges: Vec<f64>,
    angles: Vec<f64>,
    query: QueryGrid,
    vertices: Vec<Point>,
    triangles: Vec<[usize; 3]>,
    containing: Vec<Option<u32>>,
}

impl GridContext {
    pub fn new() -> Self {
        let ranges: Vec<f64> = (0..NUM_RANGE_BINS)
            .map(|i| i as f64 * RANGE_RESOLUTION)
            .collect();
        let half = (NUM_ANGLE_BINS / 2) as i32;
        let angles: Vec<f64> = (-half + 1..half)
            .map(|i| (i as f64 * 2.0 / NUM_ANGLE_BINS as f64).asin().to_degrees())
            .collect();

        let mut vertices = Vec::with_capacity(1 + ANGLE_SAMPLES * (NUM_RANGE_BINS - 1));
        vertices.push(Point::new(0., 0.));
        for angle in &angles {
            let (sin, cos) = angle.to_radians().sin_cos();
            for range in &ranges[1..] {
                vertices.push(Point::new(range * sin, range * cos));
            }
        }

        let points: Vec<delaunator::Point> = vertices
            .iter()
            .map(|p| delaunator::Point { x: p.x, y: p.y })
            .collect();
        let triangulation = delaunator::triangulate(&points);
        let triangles: Vec<[usize; 3]> = triangulation
            .triangles
            .chunks_exact(3)
            .map(|t| [t[0], t[1], t[2]])
            .collect();
        debug!(
            "Triangulated {} heatmap positions into {} triangles",
            vertices.len(),
            triangles.len()
        );

        let query = QueryGrid::new();
        let locator = TriangleLocator::new(&vertices, &triangles);
        let mut last = None;
        let containing: Vec<Option<u32>> = query
            .points()
            .map(|p| {
                if p.x.abs() > LOCATE_MAX_ABS_X || p.y < LOCATE_MIN_Y || p.y > LOCATE_MAX_Y {
                    return None;
                }
                let found = locator.locate(p, last);
                if found.is_some() {
                    last = found;
                }
                found.map(|t| t as u32)
            })
            .collect();
        debug!(
            "{} of {} query points lie inside the triangulation",
            containing.iter().filter(|c| c.is_some()).count(),
            containing.len()
        );

        GridContext {
            ranges,
            angles,
            query,
            vertices,
            triangles,
            containing,
        }
    }

    /// Range of each range bin in meters
    pub fn ranges(&self) -> &[f64] {
        &self.ranges
    }

    /// Angle of each angle sample in degrees, 0 is straight ahead
    pub fn angles(&self) -> &[f64] {
        &self.angles
    }

    pub fn query(&self) -> &QueryGrid {
        &self.query
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Vertex that holds the heatmap sample at (range bin, angle sample)
    pub fn vertex_index(range: usize, angle: usize) -> usize {
        if range == 0 {
            0
        } else {
            1 + angle * (NUM_RANGE_BINS - 1) + (range - 1)
        }
    }

    pub fn vertex_position(&self, range: usize, angle: usize) -> Point {
        self.vertices[Self::vertex_index(range, angle)]
    }

    /// The vertices of the triangle containing query point `k`, if any
    pub fn containing_triangle(&self, k: usize) -> Option<[usize; 3]> {
        self.containing[k].map(|t| self.triangles[t as usize])
    }
}

impl Default for GridContext {
    fn default() -> Self {
        Self::new()
    }
}

static SHARED: OnceCell<GridContext> = OnceCell::new();
static SHARED_SETUPS: AtomicUsize = AtomicUsize::new(0);

/// The process wide grid, built by whichever caller gets here first. Other
/// callers block until it is ready.
pub fn shared() -> &'static GridContext {
    SHARED.get_or_init(|| {
        SHARED_SETUPS.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        let grid = GridContext::new();
        info!(
            "Heatmap grid ready: {} triangles, {} query points in {:?}",
            grid.triangle_count(),
            grid.query.len(),
            start.elapsed()
        );
        grid
    })
}

pub fn shared_setups() -> usize {
    SHARED_SETUPS.load(Ordering::SeqCst)
}

// Uniform buckets over the triangle bounding boxes, so a point is only
// tested against the few triangles whose box overlaps its bucket.
struct TriangleLocator<'a> {
    vertices: &'a [Point],
    triangles: &'a [[usize; 3]],
    bounds: Vec<Bounds>,
    extent: Bounds,
    cell_w: f64,
    cell_h: f64,
    buckets: Vec<Vec<u32>>,
}

impl<'a> TriangleLocator<'a> {
    fn new(vertices: &'a [Point], triangles: &'a [[usize; 3]]) -> Self {
        let bounds: Vec<Bounds> = triangles
            .iter()
            .map(|t| Bounds::of_triangle(vertices, t))
            .collect();
        let extent = bounds.iter().fold(
            Bounds {
                min_x: f64::MAX,
                max_x: f64::MIN,
                min_y: f64::MAX,
                max_y: f64::MIN,
            },
            |e, b| Bounds {
                min_x: e.min_x.min(b.min_x),
                max_x: e.max_x.max(b.max_x),
                min_y: e.min_y.min(b.min_y),
                max_y: e.max_y.max(b.max_y),
            },
        );
        let cell_w = (extent.max_x - extent.min_x) / BUCKETS as f64;
        let cell_h = (extent.max_y - extent.min_y) / BUCKETS as f64;

        let mut locator = TriangleLocator {
            vertices,
            triangles,
            bounds: Vec::new(),
            extent,
            cell_w,
            cell_h,
            buckets: vec![Vec::new(); BUCKETS * BUCKETS],
        };
        for (t, b) in bounds.iter().enumerate() {
            let (c0, r0) = locator.cell(b.min_x, b.min_y);
            let (c1, r1) = locator.cell(b.max_x, b.max_y);
            for r in r0..=r1 {
                for c in c0..=c1 {
                    locator.buckets[r * BUCKETS + c].push(t as u32);
                }
            }
        }
        locator.bounds = bounds;
        locator
    }

    fn cell(&self, x: f64, y: f64) -> (usize, usize) {
        let c = ((x - self.extent.min_x) / self.cell_w).floor();
        let r = ((y - self.extent.min_y) / self.cell_h).floor();
        (
            (c.max(0.) as usize).min(BUCKETS - 1),
            (r.max(0.) as usize).min(BUCKETS - 1),
        )
    }

    fn locate(&self, p: Point, last: Option<usize>) -> Option<usize> {
        if let Some(t) = last {
            if self.contains(t, p) {
                return Some(t);
            }
        }
        if !self.extent.contains(p) {
            return None;
        }
        let (c, r) = self.cell(p.x, p.y);
        self.buckets[r * BUCKETS + c]
            .iter()
            .map(|&t| t as usize)
            .find(|&t| self.bounds[t].contains(p) && self.contains(t, p))
    }

    // Solve p = v0 + c1 (v1 - v0) + c2 (v2 - v0) with Cramer's rule
    fn contains(&self, t: usize, p: Point) -> bool {
        let [v0, v1, v2] = self.triangles[t].map(|v| self.vertices[v]);
        let a11 = v1.x - v0.x;
        let a12 = v1.y - v0.y;
        let a21 = v2.x - v0.x;
        let a22 = v2.y - v0.y;
        let det = a11 * a22 - a21 * a12;
        let dx1 = p.x - v0.x;
        let dx2 = p.y - v0.y;
        let c1 = (a22 * dx1 - a21 * dx2) / det;
        let c2 = (-a12 * dx1 + a11 * dx2) / det;
        c1 >= -EPS && c2 >= -EPS && (c1 + c2) <= 1. + EPS
    }
}
