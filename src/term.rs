//! Shadow terminal state and snapshot rendering.
//!
//! Every byte the child writes to its PTY is also fed through a
//! [`VirtualTerminal`] so the server always knows what the screen looks
//! like. A client that joins mid-stream is caught up with a snapshot
//! (a self-contained escape-sequence byte string) instead of a replay
//! of the whole session history.
//!
//! The parser is the `vte` state machine (the same one Alacritty uses);
//! the grid tracks glyphs plus 256-color foreground/background per cell.
//! Non-color SGR attributes are not shadowed — live output re-establishes
//! them after the first frame.

use vte::{Params, Parser, Perform};

/// Default terminal size applied when no clients are attached.
pub const DEFAULT_ROWS: u16 = 24;
/// Default terminal width applied when no clients are attached.
pub const DEFAULT_COLS: u16 = 80;

/// A single screen cell: glyph plus 256-color palette indices.
///
/// `None` means the terminal default for that channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub fg: Option<u8>,
    pub bg: Option<u8>,
}

impl Default for Cell {
    fn default() -> Self {
        Cell {
            ch: ' ',
            fg: None,
            bg: None,
        }
    }
}

/// Cell grid with cursor and current SGR color state.
///
/// Implements [`vte::Perform`] directly so the parser can drive it
/// without an intermediate performer type.
struct Grid {
    rows: u16,
    cols: u16,
    cells: Vec<Cell>,
    cursor_row: u16,
    cursor_col: u16,
    saved_cursor: Option<(u16, u16)>,
    fg: Option<u8>,
    bg: Option<u8>,
}

impl Grid {
    fn new(rows: u16, cols: u16) -> Self {
        let rows = rows.max(1);
        let cols = cols.max(1);
        Grid {
            rows,
            cols,
            cells: vec![Cell::default(); rows as usize * cols as usize],
            cursor_row: 0,
            cursor_col: 0,
            saved_cursor: None,
            fg: None,
            bg: None,
        }
    }

    fn index(&self, row: u16, col: u16) -> usize {
        row as usize * self.cols as usize + col as usize
    }

    fn cell(&self, row: u16, col: u16) -> Option<&Cell> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.cells.get(self.index(row, col))
    }

    fn put_char(&mut self, ch: char) {
        let idx = self.index(self.cursor_row, self.cursor_col);
        if let Some(cell) = self.cells.get_mut(idx) {
            cell.ch = ch;
            cell.fg = self.fg;
            cell.bg = self.bg;
        }
        self.cursor_col += 1;
        if self.cursor_col >= self.cols {
            self.cursor_col = 0;
            self.linefeed();
        }
    }

    fn linefeed(&mut self) {
        if self.cursor_row + 1 >= self.rows {
            self.scroll_up();
        } else {
            self.cursor_row += 1;
        }
    }

    /// Shift every row up by one and blank the bottom row.
    fn scroll_up(&mut self) {
        let cols = self.cols as usize;
        self.cells.copy_within(cols.., 0);
        let len = self.cells.len();
        for cell in &mut self.cells[len - cols..] {
            *cell = Cell::default();
        }
    }

    /// Shift every row down by one and blank the top row (reverse index).
    fn scroll_down(&mut self) {
        let cols = self.cols as usize;
        let len = self.cells.len();
        self.cells.copy_within(..len - cols, cols);
        for cell in &mut self.cells[..cols] {
            *cell = Cell::default();
        }
    }

    fn set_cursor(&mut self, row: u16, col: u16) {
        self.cursor_row = row.min(self.rows - 1);
        self.cursor_col = col.min(self.cols - 1);
    }

    fn clear_all(&mut self) {
        for cell in &mut self.cells {
            *cell = Cell::default();
        }
    }

    fn clear_range(&mut self, from: usize, to: usize) {
        for cell in &mut self.cells[from..to] {
            *cell = Cell::default();
        }
    }

    fn erase_display(&mut self, mode: u16) {
        let cursor = self.index(self.cursor_row, self.cursor_col);
        match mode {
            0 => {
                let len = self.cells.len();
                self.clear_range(cursor, len);
            }
            1 => self.clear_range(0, cursor + 1),
            2 | 3 => self.clear_all(),
            _ => {}
        }
    }

    fn erase_line(&mut self, mode: u16) {
        let start = self.index(self.cursor_row, 0);
        let cursor = self.index(self.cursor_row, self.cursor_col);
        let end = start + self.cols as usize;
        match mode {
            0 => self.clear_range(cursor, end),
            1 => self.clear_range(start, cursor + 1),
            2 => self.clear_range(start, end),
            _ => {}
        }
    }

    fn resize(&mut self, rows: u16, cols: u16) {
        let rows = rows.max(1);
        let cols = cols.max(1);
        if rows == self.rows && cols == self.cols {
            return;
        }
        let mut cells = vec![Cell::default(); rows as usize * cols as usize];
        let copy_rows = self.rows.min(rows);
        let copy_cols = self.cols.min(cols);
        for row in 0..copy_rows {
            for col in 0..copy_cols {
                cells[row as usize * cols as usize + col as usize] =
                    self.cells[self.index(row, col)];
            }
        }
        self.cells = cells;
        self.rows = rows;
        self.cols = cols;
        self.cursor_row = self.cursor_row.min(rows - 1);
        self.cursor_col = self.cursor_col.min(cols - 1);
        self.saved_cursor = None;
    }

    fn apply_sgr(&mut self, params: &Params) {
        // `ESC[m` with no parameters is a full reset.
        if params.is_empty() {
            self.fg = None;
            self.bg = None;
            return;
        }
        let groups: Vec<Vec<u16>> = params.iter().map(|g| g.to_vec()).collect();
        let mut i = 0;
        while i < groups.len() {
            let first = groups[i].first().copied().unwrap_or(0);
            match first {
                0 => {
                    self.fg = None;
                    self.bg = None;
                }
                30..=37 => self.fg = Some((first - 30) as u8),
                39 => self.fg = None,
                40..=47 => self.bg = Some((first - 40) as u8),
                49 => self.bg = None,
                90..=97 => self.fg = Some((first - 90 + 8) as u8),
                100..=107 => self.bg = Some((first - 100 + 8) as u8),
                38 | 48 => {
                    // 256-color and RGB selectors arrive either as colon
                    // subparameters (one group) or as separate groups.
                    let group = &groups[i];
                    let (mode, value, consumed) = if group.len() >= 2 {
                        let v = group.get(2).copied();
                        (group[1], v, 0)
                    } else {
                        let mode = groups.get(i + 1).and_then(|g| g.first().copied());
                        match mode {
                            Some(5) => {
                                let v = groups.get(i + 2).and_then(|g| g.first().copied());
                                (5, v, 2)
                            }
                            Some(2) => (2, None, 4),
                            _ => (0, None, 0),
                        }
                    };
                    if mode == 5 {
                        if let Some(v) = value {
                            let color = Some(v.min(255) as u8);
                            if first == 38 {
                                self.fg = color;
                            } else {
                                self.bg = color;
                            }
                        }
                    }
                    // RGB (mode 2) is outside the 256-color palette the
                    // snapshot can express; skip its arguments.
                    i += consumed;
                }
                // Bold, italic, underline, reverse and friends are not
                // shadowed; live output restores them on the client side.
                _ => {}
            }
            i += 1;
        }
    }

    /// First parameter of a CSI sequence, with `0` mapped to `default`.
    fn param(params: &Params, idx: usize, default: u16) -> u16 {
        params
            .iter()
            .nth(idx)
            .and_then(|p| p.first().copied())
            .filter(|v| *v != 0)
            .unwrap_or(default)
    }
}

impl Perform for Grid {
    fn print(&mut self, c: char) {
        self.put_char(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            0x08 => self.cursor_col = self.cursor_col.saturating_sub(1),
            0x09 => {
                let next_tab = ((self.cursor_col / 8) + 1) * 8;
                self.cursor_col = next_tab.min(self.cols - 1);
            }
            0x0A | 0x0B | 0x0C => self.linefeed(),
            0x0D => self.cursor_col = 0,
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {
        // Window title and friends have no on-screen representation.
    }

    fn csi_dispatch(&mut self, params: &Params, _intermediates: &[u8], _ignore: bool, action: char) {
        match action {
            'A' => {
                let n = Grid::param(params, 0, 1);
                self.cursor_row = self.cursor_row.saturating_sub(n);
            }
            'B' => {
                let n = Grid::param(params, 0, 1);
                self.cursor_row = (self.cursor_row + n).min(self.rows - 1);
            }
            'C' => {
                let n = Grid::param(params, 0, 1);
                self.cursor_col = (self.cursor_col + n).min(self.cols - 1);
            }
            'D' => {
                let n = Grid::param(params, 0, 1);
                self.cursor_col = self.cursor_col.saturating_sub(n);
            }
            'E' => {
                let n = Grid::param(params, 0, 1);
                self.cursor_col = 0;
                self.cursor_row = (self.cursor_row + n).min(self.rows - 1);
            }
            'F' => {
                let n = Grid::param(params, 0, 1);
                self.cursor_col = 0;
                self.cursor_row = self.cursor_row.saturating_sub(n);
            }
            'G' => {
                let col = Grid::param(params, 0, 1) - 1;
                self.cursor_col = col.min(self.cols - 1);
            }
            'H' | 'f' => {
                let row = Grid::param(params, 0, 1) - 1;
                let col = Grid::param(params, 1, 1) - 1;
                self.set_cursor(row, col);
            }
            'd' => {
                let row = Grid::param(params, 0, 1) - 1;
                self.cursor_row = row.min(self.rows - 1);
            }
            'J' => {
                let mode = params.iter().next().and_then(|p| p.first().copied()).unwrap_or(0);
                self.erase_display(mode);
            }
            'K' => {
                let mode = params.iter().next().and_then(|p| p.first().copied()).unwrap_or(0);
                self.erase_line(mode);
            }
            'm' => self.apply_sgr(params),
            's' => self.saved_cursor = Some((self.cursor_row, self.cursor_col)),
            'u' => {
                if let Some((row, col)) = self.saved_cursor {
                    self.set_cursor(row, col);
                }
            }
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, byte: u8) {
        match byte {
            // Reverse index: up one row, scrolling at the top margin.
            b'M' => {
                if self.cursor_row == 0 {
                    self.scroll_down();
                } else {
                    self.cursor_row -= 1;
                }
            }
            b'D' => self.linefeed(),
            b'E' => {
                self.cursor_col = 0;
                self.linefeed();
            }
            b'c' => {
                self.clear_all();
                self.cursor_row = 0;
                self.cursor_col = 0;
                self.fg = None;
                self.bg = None;
                self.saved_cursor = None;
            }
            _ => {}
        }
    }
}

/// vt100/xterm-256 shadow terminal.
///
/// Mirrors everything written to the session's clients so a snapshot of
/// the visible screen can be rendered at any instant.
pub struct VirtualTerminal {
    parser: Parser,
    grid: Grid,
}

impl VirtualTerminal {
    pub fn new(rows: u16, cols: u16) -> Self {
        VirtualTerminal {
            parser: Parser::new(),
            grid: Grid::new(rows, cols),
        }
    }

    /// Feed raw PTY output through the parser into the grid.
    pub fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.parser.advance(&mut self.grid, byte);
        }
    }

    /// Resize the grid, preserving the overlapping region.
    pub fn resize(&mut self, rows: u16, cols: u16) {
        self.grid.resize(rows, cols);
    }

    /// Current dimensions as `(rows, cols)`.
    pub fn size(&self) -> (u16, u16) {
        (self.grid.rows, self.grid.cols)
    }

    /// Current cursor position as 0-based `(row, col)`.
    pub fn cursor(&self) -> (u16, u16) {
        (self.grid.cursor_row, self.grid.cursor_col)
    }

    /// Cell at 0-based `(row, col)`, if in bounds.
    pub fn cell(&self, row: u16, col: u16) -> Option<Cell> {
        self.grid.cell(row, col).copied()
    }

    /// True once any cell holds a non-whitespace glyph.
    ///
    /// Used to delay a polling client's first snapshot until the child
    /// has printed something.
    pub fn has_visible_content(&self) -> bool {
        self.grid.cells.iter().any(|c| !c.ch.is_whitespace())
    }

    /// Render the visible screen as a self-contained escape-sequence
    /// byte string.
    ///
    /// Feeding the result to an xterm-compatible terminal of the same
    /// dimensions reproduces the screen: clear + home, then a row scan
    /// that re-emits 256-color state only when it changes, then a reset
    /// and a cursor positioning escape. Non-color attributes are not
    /// reproduced; subsequent live output restores them.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::with_capacity(
            self.grid.cells.len() + 64,
        );
        out.extend_from_slice(b"\x1b[2J\x1b[H");

        // (fg, bg) last written to the stream; None until the first cell.
        let mut emitted: Option<(Option<u8>, Option<u8>)> = None;
        let mut buf = [0u8; 4];
        for row in 0..self.grid.rows {
            if row > 0 {
                out.extend_from_slice(b"\r\n");
            }
            for col in 0..self.grid.cols {
                let cell = self.grid.cells[self.grid.index(row, col)];
                let colors = (cell.fg, cell.bg);
                let needs_emit = match emitted {
                    None => colors != (None, None),
                    Some(prev) => prev != colors,
                };
                if needs_emit {
                    out.extend_from_slice(b"\x1b[0m");
                    if let Some(fg) = cell.fg {
                        out.extend_from_slice(format!("\x1b[38;5;{}m", fg).as_bytes());
                    }
                    if let Some(bg) = cell.bg {
                        out.extend_from_slice(format!("\x1b[48;5;{}m", bg).as_bytes());
                    }
                }
                if needs_emit || emitted.is_none() {
                    emitted = Some(colors);
                }
                out.extend_from_slice(cell.ch.encode_utf8(&mut buf).as_bytes());
            }
        }

        out.extend_from_slice(b"\x1b[0m");
        out.extend_from_slice(
            format!(
                "\x1b[{};{}H",
                self.grid.cursor_row + 1,
                self.grid.cursor_col + 1
            )
            .as_bytes(),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_text(term: &VirtualTerminal, row: u16) -> String {
        let (_, cols) = term.size();
        (0..cols)
            .map(|col| term.cell(row, col).unwrap().ch)
            .collect::<String>()
            .trim_end()
            .to_string()
    }

    #[test]
    fn plain_text_lands_in_grid() {
        let mut term = VirtualTerminal::new(24, 80);
        term.write(b"Hello\r\nWorld\r\n");
        assert_eq!(row_text(&term, 0), "Hello");
        assert_eq!(row_text(&term, 1), "World");
        assert_eq!(term.cursor(), (2, 0));
    }

    #[test]
    fn wraps_at_right_margin() {
        let mut term = VirtualTerminal::new(4, 5);
        term.write(b"abcdefg");
        assert_eq!(row_text(&term, 0), "abcde");
        assert_eq!(row_text(&term, 1), "fg");
        assert_eq!(term.cursor(), (1, 2));
    }

    #[test]
    fn scrolls_at_bottom() {
        let mut term = VirtualTerminal::new(3, 10);
        term.write(b"one\r\ntwo\r\nthree\r\nfour");
        assert_eq!(row_text(&term, 0), "two");
        assert_eq!(row_text(&term, 1), "three");
        assert_eq!(row_text(&term, 2), "four");
    }

    #[test]
    fn tracks_basic_and_256_colors() {
        let mut term = VirtualTerminal::new(4, 20);
        term.write(b"\x1b[31mred\x1b[0m \x1b[38;5;196mX\x1b[48;5;21mY");
        assert_eq!(term.cell(0, 0).unwrap().fg, Some(1));
        assert_eq!(term.cell(0, 3).unwrap().fg, None);
        assert_eq!(term.cell(0, 4).unwrap().fg, Some(196));
        let y = term.cell(0, 5).unwrap();
        assert_eq!(y.fg, Some(196));
        assert_eq!(y.bg, Some(21));
    }

    #[test]
    fn bright_colors_map_into_palette() {
        let mut term = VirtualTerminal::new(2, 10);
        term.write(b"\x1b[92mg\x1b[103my");
        assert_eq!(term.cell(0, 0).unwrap().fg, Some(10));
        assert_eq!(term.cell(0, 1).unwrap().bg, Some(11));
    }

    #[test]
    fn cursor_addressing_and_erase() {
        let mut term = VirtualTerminal::new(5, 10);
        term.write(b"aaaaa\r\nbbbbb\r\nccccc");
        term.write(b"\x1b[2;3H\x1b[K");
        assert_eq!(row_text(&term, 1), "bb");
        term.write(b"\x1b[H\x1b[2J");
        assert_eq!(row_text(&term, 0), "");
        assert_eq!(term.cursor(), (0, 0));
    }

    #[test]
    fn resize_preserves_overlap_and_clamps_cursor() {
        let mut term = VirtualTerminal::new(10, 40);
        term.write(b"keep me\x1b[10;40H");
        term.resize(5, 20);
        assert_eq!(term.size(), (5, 20));
        assert_eq!(row_text(&term, 0), "keep me");
        let (row, col) = term.cursor();
        assert!(row < 5 && col < 20);
    }

    #[test]
    fn snapshot_of_empty_screen_is_colorless() {
        let term = VirtualTerminal::new(2, 3);
        let snap = String::from_utf8(term.snapshot()).unwrap();
        assert!(snap.starts_with("\x1b[2J\x1b[H"));
        assert!(snap.ends_with("\x1b[0m\x1b[1;1H"));
        // No color selectors for an all-default screen.
        assert!(!snap.contains("38;5"));
        assert!(!snap.contains("48;5"));
    }

    #[test]
    fn snapshot_emits_color_runs_once() {
        let mut term = VirtualTerminal::new(1, 6);
        term.write(b"\x1b[38;5;40mab\x1b[0mcd");
        let snap = String::from_utf8(term.snapshot()).unwrap();
        // One selector for the colored run, one reset when it ends.
        assert_eq!(snap.matches("\x1b[38;5;40m").count(), 1);
        assert!(snap.contains("\x1b[0m\x1b[38;5;40mab\x1b[0mcd"));
    }

    #[test]
    fn snapshot_positions_cursor_one_based() {
        let mut term = VirtualTerminal::new(24, 80);
        term.write(b"Hello\r\nWorld\r\n");
        let snap = String::from_utf8(term.snapshot()).unwrap();
        assert!(snap.ends_with("\x1b[3;1H"));
    }

    #[test]
    fn snapshot_round_trips_through_a_fresh_terminal() {
        let mut term = VirtualTerminal::new(6, 30);
        term.write(b"\x1b[31mHello\x1b[0m world\r\n\x1b[48;5;21m blue \x1b[0m\r\nplain");
        let snap = term.snapshot();

        let mut replay = VirtualTerminal::new(6, 30);
        replay.write(&snap);

        for row in 0..6 {
            for col in 0..30 {
                assert_eq!(
                    term.cell(row, col),
                    replay.cell(row, col),
                    "cell ({row},{col}) differs"
                );
            }
        }
        assert_eq!(term.cursor(), replay.cursor());
    }

    #[test]
    fn consecutive_snapshots_are_identical() {
        let mut term = VirtualTerminal::new(10, 40);
        term.write(b"stable \x1b[32mscreen\x1b[0m state");
        assert_eq!(term.snapshot(), term.snapshot());
    }

    #[test]
    fn visible_content_detection() {
        let mut term = VirtualTerminal::new(4, 10);
        assert!(!term.has_visible_content());
        term.write(b"   \r\n\r\n");
        assert!(!term.has_visible_content());
        term.write(b"x");
        assert!(term.has_visible_content());
    }
}
