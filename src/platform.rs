use std::io;

/// Panel-side operations the vsync worker depends on. The live
/// implementation wraps the framebuffer device; tests substitute
/// recording fakes to drive the worker deterministically.
pub(crate) trait PanelIo: Send {
    /// Blank or unblank the panel supply. Must be edge-idempotent.
    fn set_power(&mut self, on: bool) -> io::Result<()>;

    /// Copy an encoded frame into the given virtual frame slot.
    fn write_frame(&mut self, slot: usize, frame: &[u8]);

    /// Pan the visible region onto `slot`. The first presentation after
    /// start-up programs the full screen info; later ones pan and block
    /// until the previous frame's vsync boundary.
    fn present(&mut self, slot: usize, first: bool) -> io::Result<()>;
}
