//! Level geometry of a pyramid ladder.

/// Dimensions and downsample factors of every level of a raster's ladder.
///
/// Level 0 is the source. Level `n` has the floor-divided extent of level
/// `n - 1` and a downsample of `factor^n` relative to level 0. Levels are added
/// while the longest side of the previous level exceeds `min_level_length`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyramidLayout {
    factor: u32,
    dims: Vec<(u32, u32)>,
}

impl PyramidLayout {
    /// Compute the ladder of a `width` x `height` source.
    ///
    /// With `enabled == false` the ladder holds level 0 only.
    pub fn new(width: u32, height: u32, factor: u32, min_level_length: u32, enabled: bool) -> Self {
        let factor = factor.max(2);
        let mut dims = vec![(width, height)];

        if enabled {
            let (mut w, mut h) = (width, height);
            while w.max(h) > min_level_length {
                let (nw, nh) = (w / factor, h / factor);
                if nw == 0 || nh == 0 {
                    break;
                }
                dims.push((nw, nh));
                (w, h) = (nw, nh);
            }
        }

        Self { factor, dims }
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    /// Index of the coarsest level.
    pub fn max_level(&self) -> usize {
        self.dims.len() - 1
    }

    pub fn level_count(&self) -> usize {
        self.dims.len()
    }

    /// `(width, height)` of a level, or `None` beyond the ladder.
    pub fn dimensions(&self, level: usize) -> Option<(u32, u32)> {
        self.dims.get(level).copied()
    }

    /// Downsample of a level relative to level 0.
    pub fn downsample(&self, level: usize) -> Option<f64> {
        (level < self.dims.len()).then(|| (self.factor as f64).powi(level as i32))
    }

    /// Find the coarsest level whose downsample does not exceed the request.
    ///
    /// Never selects a level that would need upsampling to reach the requested
    /// density; requests below 1 resolve to level 0.
    pub fn best_level_for_downsample(&self, downsample: f64) -> usize {
        let mut best = 0;
        for level in 1..self.dims.len() {
            let d = (self.factor as f64).powi(level as i32);
            if d <= downsample * (1.0 + 1e-9) {
                best = level;
            } else {
                break;
            }
        }
        best
    }
}
