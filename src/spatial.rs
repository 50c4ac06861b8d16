// Spatial index - uniform grid over 3D space for neighbor lookups
// Cells are keyed by floor(position / cell_size) in a hash map, so the world
// is unbounded. The index is cleared and rebuilt once per step.

use std::collections::HashMap;

use crate::types::Vec3;

type CellKey = (i64, i64, i64);

#[derive(Clone, Copy, Debug)]
struct Entry {
    handle: usize,
    position: Vec3,
}

pub struct SpatialIndex {
    cell_size: f32,
    cells: HashMap<CellKey, Vec<Entry>>,
    len: usize,
}

impl SpatialIndex {
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size: sanitize_cell_size(cell_size),
            cells: HashMap::new(),
            len: 0,
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Changing the cell size invalidates every bucket, so the index is cleared.
    pub fn set_cell_size(&mut self, cell_size: f32) {
        let cell_size = sanitize_cell_size(cell_size);
        if (cell_size - self.cell_size).abs() > f32::EPSILON {
            self.cell_size = cell_size;
            self.cells.clear();
            self.len = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn cell_of(&self, position: Vec3) -> CellKey {
        (
            cell_coord(position.x, self.cell_size),
            cell_coord(position.y, self.cell_size),
            cell_coord(position.z, self.cell_size),
        )
    }

    pub fn clear(&mut self) {
        // Drop the bucket table when it is mostly empty cells from old positions
        if self.cells.len() > 4 * self.len.max(64) {
            self.cells.clear();
        } else {
            for bucket in self.cells.values_mut() {
                bucket.clear();
            }
        }
        self.len = 0;
    }

    /// Insert an entity handle. Non-finite positions are skipped.
    pub fn insert(&mut self, handle: usize, position: Vec3) {
        if !position.is_finite() {
            return;
        }
        let key = self.cell_of(position);
        self.cells
            .entry(key)
            .or_default()
            .push(Entry { handle, position });
        self.len += 1;
    }

    pub fn rebuild<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (usize, Vec3)>,
    {
        self.clear();
        for (handle, position) in entries {
            self.insert(handle, position);
        }
    }

    /// Handles within `radius` (inclusive) of `position`, paired with their
    /// squared distance. Scans the 3x3x3 neighborhood, widened when the
    /// radius exceeds the cell size. A neighborhood with more cells than the
    /// table holds is replaced by a scan of every bucket.
    pub fn query_neighbors(
        &self,
        position: Vec3,
        radius: f32,
    ) -> impl Iterator<Item = (usize, f32)> + '_ {
        let valid = position.is_finite() && radius.is_finite() && radius >= 0.0;
        let radius_sq = radius * radius;
        let reach = if valid {
            ((radius as f64 / self.cell_size as f64).ceil() as i64).max(1)
        } else {
            0
        };
        let side = (reach as u64).saturating_mul(2).saturating_add(1);
        let volume = side.saturating_mul(side).saturating_mul(side);
        let scan_all = valid && volume > self.cells.len() as u64;

        let (cx, cy, cz) = if valid {
            self.cell_of(position)
        } else {
            (0, 0, 0)
        };
        let span = if valid && !scan_all { -reach..=reach } else { 1..=0 };
        let span_y = span.clone();
        let span_z = span.clone();

        let near = span
            .flat_map(move |dx| span_y.clone().map(move |dy| (dx, dy)))
            .flat_map(move |(dx, dy)| span_z.clone().map(move |dz| (dx, dy, dz)))
            .filter_map(move |(dx, dy, dz)| {
                // Cells past the edge of the key space hold nothing
                let key = (cx.checked_add(dx)?, cy.checked_add(dy)?, cz.checked_add(dz)?);
                self.cells.get(&key)
            });
        let everything = self
            .cells
            .values()
            .take(if scan_all { usize::MAX } else { 0 });

        near.chain(everything)
            .flat_map(|bucket| bucket.iter())
            .filter_map(move |entry| {
                let d_sq = entry.position.distance_squared(position);
                (d_sq <= radius_sq).then_some((entry.handle, d_sq))
            })
    }
}

// Float-to-int casts saturate, so coordinates beyond the key range share the
// outermost cells. Saturation never moves two cells further apart, so the
// neighborhood scan still covers every point within the radius.
fn cell_coord(value: f32, cell_size: f32) -> i64 {
    (value as f64 / cell_size as f64).floor() as i64
}

fn sanitize_cell_size(cell_size: f32) -> f32 {
    if cell_size.is_finite() && cell_size > 0.0 {
        cell_size
    } else {
        1.0
    }
}
