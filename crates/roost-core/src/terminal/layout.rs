//! Screen geometry: which rows belong to the overlay and which scroll.
//!
//! Rows are 1-based, matching the ANSI cursor-position and DECSTBM
//! conventions the controller and renderer emit.

/// Height of the top status bar.
pub const STATUS_BAR_ROWS: u16 = 1;
/// Height of the sidebar panel drawn directly under the bar.
pub const SIDEBAR_ROWS: u16 = 7;
/// Content rows that must remain before the sidebar is shown.
pub const MIN_CONTENT_ROWS: u16 = 8;
/// Content rows that must remain before the bar alone is shown.
pub const MIN_BAR_CONTENT_ROWS: u16 = 2;
/// Narrowest terminal that still gets a sidebar.
pub const MIN_SIDEBAR_COLS: u16 = 40;
/// Narrowest terminal that still gets a status bar.
pub const MIN_BAR_COLS: u16 = 20;

/// Terminal size in cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub cols: u16,
    pub rows: u16,
}

impl Viewport {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

/// Where the sidebar panel sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidebarGeometry {
    /// First row of the panel.
    pub top: u16,
    pub height: u16,
    pub width: u16,
}

/// How the screen is split between overlay and backend output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// No overlay and no scroll region; the backend owns every row.
    /// `viewport` is `None` when the size could not be probed.
    Passthrough { viewport: Option<Viewport> },
    /// Bar (and optionally sidebar) reserved at the top, output below.
    Overlay {
        viewport: Viewport,
        sidebar: Option<SidebarGeometry>,
    },
}

impl Layout {
    /// Decide the layout for a probed viewport.
    ///
    /// The sidebar is dropped first when space runs out; the bar goes
    /// last, leaving full-screen passthrough.
    pub fn compute(viewport: Option<Viewport>, sidebar_enabled: bool) -> Self {
        let Some(vp) = viewport else {
            return Self::Passthrough { viewport: None };
        };

        if vp.cols < MIN_BAR_COLS || vp.rows < STATUS_BAR_ROWS + MIN_BAR_CONTENT_ROWS {
            return Self::Passthrough { viewport: Some(vp) };
        }

        let sidebar_fits = vp.cols >= MIN_SIDEBAR_COLS
            && vp.rows >= STATUS_BAR_ROWS + SIDEBAR_ROWS + MIN_CONTENT_ROWS;

        let sidebar = (sidebar_enabled && sidebar_fits).then_some(SidebarGeometry {
            top: STATUS_BAR_ROWS + 1,
            height: SIDEBAR_ROWS,
            width: vp.cols,
        });

        Self::Overlay {
            viewport: vp,
            sidebar,
        }
    }

    pub fn viewport(&self) -> Option<Viewport> {
        match self {
            Self::Passthrough { viewport } => *viewport,
            Self::Overlay { viewport, .. } => Some(*viewport),
        }
    }

    pub fn sidebar(&self) -> Option<SidebarGeometry> {
        match self {
            Self::Passthrough { .. } => None,
            Self::Overlay { sidebar, .. } => *sidebar,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::Passthrough { .. })
    }

    /// Rows reserved for the overlay at the top of the screen.
    pub fn reserved_rows(&self) -> u16 {
        match self {
            Self::Passthrough { .. } => 0,
            Self::Overlay { sidebar, .. } => {
                STATUS_BAR_ROWS + sidebar.map(|s| s.height).unwrap_or(0)
            }
        }
    }

    /// Size of the area the backend draws into, if known.
    pub fn content_size(&self) -> Option<Viewport> {
        let vp = self.viewport()?;
        Some(Viewport::new(vp.cols, vp.rows - self.reserved_rows()))
    }

    /// `(top, bottom)` rows of the scroll region, inclusive.
    pub fn scroll_region(&self) -> Option<(u16, u16)> {
        match self {
            Self::Passthrough { .. } => None,
            Self::Overlay { viewport, .. } => Some((self.reserved_rows() + 1, viewport.rows)),
        }
    }
}
