//! Output and display-mode selection bookkeeping.
//!
//! Outputs come from the window collaborator; the device only tracks which
//! one is current and bounds-checks every index.

use crate::error::{GpuError, Result};

/// A single display mode exposed by an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    /// Refresh rate in millihertz.
    pub refresh_rate: u32,
}

/// One output (monitor) and its display modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    pub name: String,
    pub modes: Vec<DisplayMode>,
}

/// Window dimensions used to size swapchain-dependent resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowParams {
    pub width: u32,
    pub height: u32,
}

impl WindowParams {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for WindowParams {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

/// Source of output information, implemented by the windowing layer.
pub trait DisplaySource {
    fn displays(&self) -> Vec<DisplayInfo>;
}

/// A fixed list of outputs, for headless targets and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDisplays(pub Vec<DisplayInfo>);

impl DisplaySource for StaticDisplays {
    fn displays(&self) -> Vec<DisplayInfo> {
        self.0.clone()
    }
}

/// Current output / display-mode selection.
#[derive(Debug, Clone, Default)]
pub struct DisplaySelection {
    outputs: Vec<DisplayInfo>,
    current_output: usize,
    current_mode: usize,
}

impl DisplaySelection {
    /// Snapshot the outputs of a source. Selection starts at output 0, mode 0.
    pub fn from_source(source: &dyn DisplaySource) -> Self {
        Self {
            outputs: source.displays(),
            current_output: 0,
            current_mode: 0,
        }
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn output_info(&self, id: usize) -> Result<&DisplayInfo> {
        self.outputs
            .get(id)
            .ok_or_else(|| GpuError::out_of_range("output", id, self.outputs.len()))
    }

    pub fn current_output(&self) -> usize {
        self.current_output
    }

    /// Select an output. The display mode resets to the output's first mode.
    pub fn set_current_output(&mut self, id: usize) -> Result<()> {
        if id >= self.outputs.len() {
            return Err(GpuError::out_of_range("output", id, self.outputs.len()));
        }
        self.current_output = id;
        self.current_mode = 0;
        Ok(())
    }

    /// Number of display modes of an output.
    pub fn display_mode_count(&self, output: usize) -> Result<usize> {
        self.output_info(output).map(|info| info.modes.len())
    }

    /// Display mode `id` of the current output.
    pub fn display_mode_info(&self, id: usize) -> Result<DisplayMode> {
        let modes = self.current_modes();
        modes
            .get(id)
            .copied()
            .ok_or_else(|| GpuError::out_of_range("display mode", id, modes.len()))
    }

    pub fn current_display_mode(&self) -> usize {
        self.current_mode
    }

    pub fn set_current_display_mode(&mut self, id: usize) -> Result<()> {
        let count = self.current_modes().len();
        if id >= count {
            return Err(GpuError::out_of_range("display mode", id, count));
        }
        self.current_mode = id;
        Ok(())
    }

    /// Window parameters for the current output's current mode.
    pub fn window_params(&self) -> Option<WindowParams> {
        self.current_modes()
            .get(self.current_mode)
            .map(|mode| WindowParams::new(mode.width, mode.height))
    }

    fn current_modes(&self) -> &[DisplayMode] {
        self.outputs
            .get(self.current_output)
            .map_or(&[], |info| info.modes.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(width: u32, height: u32) -> DisplayMode {
        DisplayMode {
            width,
            height,
            refresh_rate: 60_000,
        }
    }

    fn selection() -> DisplaySelection {
        DisplaySelection::from_source(&StaticDisplays(vec![
            DisplayInfo {
                name: "primary".into(),
                modes: vec![mode(1920, 1080), mode(2560, 1440)],
            },
            DisplayInfo {
                name: "secondary".into(),
                modes: vec![mode(1280, 1024)],
            },
        ]))
    }

    #[test]
    fn out_of_range_output_leaves_selection_unchanged() {
        let mut sel = selection();
        sel.set_current_output(1).unwrap();
        let err = sel.set_current_output(2).unwrap_err();
        assert!(matches!(
            err,
            GpuError::IndexOutOfRange { index: 2, count: 2, .. }
        ));
        assert_eq!(sel.current_output(), 1);
    }

    #[test]
    fn out_of_range_mode_leaves_selection_unchanged() {
        let mut sel = selection();
        sel.set_current_display_mode(1).unwrap();
        assert!(sel.set_current_display_mode(2).is_err());
        assert_eq!(sel.current_display_mode(), 1);
        assert!(sel.display_mode_info(2).is_err());
    }

    #[test]
    fn changing_output_resets_mode() {
        let mut sel = selection();
        sel.set_current_display_mode(1).unwrap();
        sel.set_current_output(1).unwrap();
        assert_eq!(sel.current_display_mode(), 0);
        assert_eq!(sel.window_params(), Some(WindowParams::new(1280, 1024)));
    }

    #[test]
    fn mode_counts_per_output() {
        let sel = selection();
        assert_eq!(sel.display_mode_count(0).unwrap(), 2);
        assert_eq!(sel.display_mode_count(1).unwrap(), 1);
        assert!(sel.display_mode_count(5).is_err());
        assert_eq!(sel.output_info(0).unwrap().name, "primary");
    }

    #[test]
    fn empty_source_has_no_window_params() {
        let mut sel = DisplaySelection::from_source(&StaticDisplays::default());
        assert_eq!(sel.output_count(), 0);
        assert_eq!(sel.window_params(), None);
        assert!(sel.set_current_output(0).is_err());
    }
}
