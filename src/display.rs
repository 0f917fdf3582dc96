//! ```text
//! ==============================================================================
//! display.rs - rendering the measurement cache
//! ==============================================================================
//!
//! purpose:
//!     turns the subscriber's cache into text lines on a draw surface.
//!     the surface is whatever can clear, draw a string at a pixel position
//!     and present the frame: an rgb led matrix on the pi, the terminal here.
//!
//! layout (64x64 panel, 7x13 font):
//!
//!     y=24   ts0: 0.08
//!     y=48   ts1: --
//!
//! relationships:
//!     - used by: subscriber.rs (renders after every applied message)
//!     - used by: main.rs (ConsoleSurface as the default sink)
//!
//! ==============================================================================
//! ```

use crate::error::Result;
use crate::subscriber::MeasurementCache;
use serde::{Deserialize, Serialize};
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

pub const YELLOW: Rgb = Rgb(255, 255, 0);

/// the pixel sink
pub trait DrawSurface: Send {
    fn clear(&mut self) -> Result<()>;
    fn draw_text(&mut self, x: i32, y: i32, color: Rgb, text: &str) -> Result<()>;
    /// make the drawn frame visible
    fn present(&mut self) -> Result<()>;
}

/// what the subscriber calls after each cache update
pub trait Renderer: Send {
    fn render(&mut self, cache: &MeasurementCache) -> Result<()>;
    /// final blank-out on shutdown
    fn clear(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanelLayout {
    pub x: i32,
    pub first_baseline: i32,
    pub line_spacing: i32,
    pub color: Rgb,
}

impl Default for PanelLayout {
    fn default() -> Self {
        Self {
            x: 1,
            first_baseline: 24,
            line_spacing: 24,
            color: YELLOW,
        }
    }
}

/// one `"<label>: <value>"` line per cached key
pub struct TextPanel<S> {
    surface: S,
    layout: PanelLayout,
}

impl<S: DrawSurface> TextPanel<S> {
    pub fn new(surface: S, layout: PanelLayout) -> Self {
        Self { surface, layout }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn lines(cache: &MeasurementCache) -> Vec<String> {
        cache
            .entries()
            .map(|(key, value)| match value {
                Some(v) => format!("{}: {}", key.short_label(), v),
                None => format!("{}: {}", key.short_label(), cache.placeholder()),
            })
            .collect()
    }
}

impl<S: DrawSurface> Renderer for TextPanel<S> {
    fn render(&mut self, cache: &MeasurementCache) -> Result<()> {
        self.surface.clear()?;
        let mut y = self.layout.first_baseline;
        for line in Self::lines(cache) {
            self.surface.draw_text(self.layout.x, y, self.layout.color, &line)?;
            y += self.layout.line_spacing;
        }
        self.surface.present()
    }

    fn clear(&mut self) -> Result<()> {
        self.surface.clear()?;
        self.surface.present()
    }
}

// ==============================================================================
// console surface - terminal stand-in for the led matrix
// ==============================================================================

/// collects text per frame and prints it on `present`
#[derive(Default)]
pub struct ConsoleSurface {
    pending: Vec<(i32, i32, String)>,
    frames: u64,
}

impl ConsoleSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl DrawSurface for ConsoleSurface {
    fn clear(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn draw_text(&mut self, x: i32, y: i32, _color: Rgb, text: &str) -> Result<()> {
        self.pending.push((x, y, text.to_string()));
        Ok(())
    }

    fn present(&mut self) -> Result<()> {
        self.frames += 1;
        // top-to-bottom regardless of draw order
        self.pending.sort_by_key(|(x, y, _)| (*y, *x));
        let mut out = std::io::stdout().lock();
        writeln!(out, "[DISPLAY] frame {}", self.frames)?;
        for (_, _, text) in &self.pending {
            writeln!(out, "[DISPLAY]   {}", text)?;
        }
        out.flush()?;
        Ok(())
    }
}
