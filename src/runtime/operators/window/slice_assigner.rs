use crate::common::{SliceIndex, Timestamp};

use super::error::{WindowError, WindowResult};
use super::window_config::WindowType;

/// Maps event time onto slices and slices onto windows.
///
/// Windows are aligned at timestamp 0: window `k` covers `[k * slide, k * slide + size)`.
/// Slices have length `gcd(size, slide)` so that every window is a contiguous run of
/// whole slices and every record belongs to exactly one slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceAssigner {
    window_size: Timestamp,
    window_slide: Timestamp,
    slice_len: Timestamp,
}

impl SliceAssigner {
    pub fn new(window: WindowType) -> WindowResult<Self> {
        let (size, slide) = window.size_and_slide();
        if size == 0 || slide == 0 {
            return Err(WindowError::InvalidConfig(format!(
                "window size and slide must be positive, got size={} slide={}",
                size, slide
            )));
        }
        if slide > size {
            return Err(WindowError::InvalidConfig(format!(
                "window slide {} exceeds window size {}",
                slide, size
            )));
        }
        Ok(Self {
            window_size: size,
            window_slide: slide,
            slice_len: gcd(size, slide),
        })
    }

    pub fn window_size(&self) -> Timestamp {
        self.window_size
    }

    pub fn window_slide(&self) -> Timestamp {
        self.window_slide
    }

    pub fn slice_len(&self) -> Timestamp {
        self.slice_len
    }

    pub fn slice_index(&self, ts: Timestamp) -> SliceIndex {
        ts / self.slice_len
    }

    pub fn slice_start(&self, index: SliceIndex) -> Timestamp {
        index.saturating_mul(self.slice_len)
    }

    pub fn slice_end(&self, index: SliceIndex) -> Timestamp {
        index.saturating_add(1).saturating_mul(self.slice_len)
    }

    /// Slice index range `[first, last)` making up the window `[start, end)`.
    pub fn slice_range(&self, window_start: Timestamp, window_end: Timestamp) -> (SliceIndex, SliceIndex) {
        (window_start / self.slice_len, window_end / self.slice_len)
    }

    /// End of the latest window that still contains the slice.
    pub fn last_window_end(&self, index: SliceIndex) -> Timestamp {
        let start = self.slice_start(index);
        (start / self.window_slide * self.window_slide).saturating_add(self.window_size)
    }

    /// `(start, end)` of every window containing the slice, in ascending order.
    pub fn windows_containing(&self, index: SliceIndex) -> impl Iterator<Item = (Timestamp, Timestamp)> {
        let slice_start = self.slice_start(index);
        let slice_end = self.slice_end(index);
        let first_k = if slice_end > self.window_size {
            div_ceil(slice_end - self.window_size, self.window_slide)
        } else {
            0
        };
        let last_k = slice_start / self.window_slide;
        let (size, slide) = (self.window_size, self.window_slide);
        (first_k..=last_k).map(move |k| {
            let start = k * slide;
            (start, start.saturating_add(size))
        })
    }

    /// Lowest slice index that some window ending after `watermark` still needs.
    pub fn first_live_index(&self, watermark: Timestamp) -> SliceIndex {
        if watermark < self.window_size {
            return 0;
        }
        let min_window = (watermark - self.window_size) / self.window_slide + 1;
        min_window.saturating_mul(self.window_slide / self.slice_len)
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn div_ceil(a: u64, b: u64) -> u64 {
    a / b + u64::from(a % b != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sliding(size: u64, slide: u64) -> SliceAssigner {
        SliceAssigner::new(WindowType::Sliding {
            size_ms: size,
            slide_ms: slide,
        })
        .unwrap()
    }

    #[test]
    fn tumbling_slices_equal_windows() {
        let a = SliceAssigner::new(WindowType::Tumbling { size_ms: 10 }).unwrap();
        assert_eq!(a.slice_len(), 10);
        assert_eq!(a.slice_index(0), 0);
        assert_eq!(a.slice_index(9), 0);
        assert_eq!(a.slice_index(12), 1);
        assert_eq!(a.windows_containing(1).collect::<Vec<_>>(), vec![(10, 20)]);
        assert_eq!(a.last_window_end(1), 20);
    }

    #[test]
    fn sliding_slices_use_gcd_length() {
        let a = sliding(10, 4);
        assert_eq!(a.slice_len(), 2);
        // slice [8, 10) belongs to windows starting at 0, 4 and 8
        assert_eq!(
            a.windows_containing(4).collect::<Vec<_>>(),
            vec![(0, 10), (4, 14), (8, 18)]
        );
        assert_eq!(a.last_window_end(4), 18);
        assert_eq!(a.slice_range(4, 14), (2, 7));
    }

    #[test]
    fn first_live_index_matches_last_window_end() {
        for (size, slide) in [(10, 10), (10, 2), (10, 4), (6, 4)] {
            let a = sliding(size, slide);
            for wm in 0..60 {
                let first = a.first_live_index(wm);
                assert!(a.last_window_end(first) > wm, "size={size} slide={slide} wm={wm}");
                if first > 0 {
                    assert!(a.last_window_end(first - 1) <= wm, "size={size} slide={slide} wm={wm}");
                }
            }
        }
    }

    #[test]
    fn invalid_windows_are_rejected() {
        assert!(SliceAssigner::new(WindowType::Tumbling { size_ms: 0 }).is_err());
        assert!(SliceAssigner::new(WindowType::Sliding { size_ms: 5, slide_ms: 0 }).is_err());
        assert!(SliceAssigner::new(WindowType::Sliding { size_ms: 5, slide_ms: 10 }).is_err());
    }
}
