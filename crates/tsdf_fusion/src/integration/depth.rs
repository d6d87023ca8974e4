//! Depth data provider interface and an owned row-major depth image.

/// Source of per-pixel depth (metres) and confidence levels.
///
/// Non-finite or non-positive depths are invalid. Coordinates outside the
/// image must return an invalid depth rather than panic.
pub trait DepthProvider: Sync {
  fn width(&self) -> usize;
  fn height(&self) -> usize;
  fn depth_at(&self, x: usize, y: usize) -> f32;
  fn confidence_at(&self, x: usize, y: usize) -> u8;

  /// Depth at (x, y) if it is finite and inside `[min, max]`.
  #[inline]
  fn valid_depth_at(&self, x: usize, y: usize, min: f32, max: f32) -> Option<f32> {
    let depth = self.depth_at(x, y);
    (depth.is_finite() && depth >= min && depth <= max).then_some(depth)
  }
}

/// Owned depth + confidence image.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthImage {
  width: usize,
  height: usize,
  depth: Vec<f32>,
  confidence: Vec<u8>,
}

impl DepthImage {
  /// Image with every pixel invalid.
  pub fn new(width: usize, height: usize) -> Self {
    Self {
      width,
      height,
      depth: vec![0.0; width * height],
      confidence: vec![0; width * height],
    }
  }

  /// Fill every pixel from `f(x, y) -> (depth, confidence)`.
  pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> (f32, u8)) -> Self {
    let mut image = Self::new(width, height);
    for y in 0..height {
      for x in 0..width {
        let (depth, confidence) = f(x, y);
        image.set(x, y, depth, confidence);
      }
    }
    image
  }

  /// Copy any provider into an owned image.
  pub fn capture(provider: &dyn DepthProvider) -> Self {
    Self::from_fn(provider.width(), provider.height(), |x, y| {
      (provider.depth_at(x, y), provider.confidence_at(x, y))
    })
  }

  pub fn set(&mut self, x: usize, y: usize, depth: f32, confidence: u8) {
    if x < self.width && y < self.height {
      let i = y * self.width + x;
      self.depth[i] = depth;
      self.confidence[i] = confidence;
    }
  }

  pub fn depths(&self) -> &[f32] {
    &self.depth
  }
}

impl DepthProvider for DepthImage {
  #[inline]
  fn width(&self) -> usize {
    self.width
  }

  #[inline]
  fn height(&self) -> usize {
    self.height
  }

  #[inline]
  fn depth_at(&self, x: usize, y: usize) -> f32 {
    if x < self.width && y < self.height {
      self.depth[y * self.width + x]
    } else {
      f32::NAN
    }
  }

  #[inline]
  fn confidence_at(&self, x: usize, y: usize) -> u8 {
    if x < self.width && y < self.height {
      self.confidence[y * self.width + x]
    } else {
      0
    }
  }
}
