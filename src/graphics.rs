use crate::model::ButtonStyle;
use tracing::debug;

/// Bitmap dimensions of a rendered control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapSize {
    pub width: u32,
    pub height: u32,
}

/// Graphics collaborator: rendering itself lives outside the core, the core
/// only requests invalidation and preview renders.
pub trait GraphicsHandle: Send + Sync {
    /// Request a (debounced upstream) redraw of a control.
    fn invalidate_control(&self, control_id: &str);

    /// Bitmap size for a drawable control, `None` for non-drawable ones.
    fn bitmap_size(&self, control_id: &str) -> Option<BitmapSize>;

    /// Render a preview of a style, `None` when previews are unsupported.
    fn draw_preview(&self, style: &ButtonStyle) -> Option<Vec<u8>>;
}

/// Headless graphics backend: logs invalidations, renders nothing.
#[derive(Debug, Default)]
pub struct NullGraphics;

impl GraphicsHandle for NullGraphics {
    fn invalidate_control(&self, control_id: &str) {
        debug!("invalidate control {control_id}");
    }

    fn bitmap_size(&self, _control_id: &str) -> Option<BitmapSize> {
        None
    }

    fn draw_preview(&self, _style: &ButtonStyle) -> Option<Vec<u8>> {
        None
    }
}
