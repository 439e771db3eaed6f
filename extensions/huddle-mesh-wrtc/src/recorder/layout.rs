/// A rectangle on the canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Columns and rows of a roughly square grid holding `tiles` cells
pub fn dimensions(tiles: usize) -> (u32, u32) {
    if tiles == 0 {
        return (0, 0);
    }
    let columns = (tiles as f64).sqrt().ceil() as usize;
    let rows = (tiles + columns - 1) / columns;
    (columns as u32, rows as u32)
}

/// Cells for `tiles` pictures on a `width`x`height` canvas, row by row
pub fn grid(tiles: usize, width: u32, height: u32) -> Vec<Cell> {
    let (columns, rows) = dimensions(tiles);
    if columns == 0 {
        return vec![];
    }
    let cell_width = width / columns;
    let cell_height = height / rows;
    (0..tiles as u32)
        .map(|i| Cell {
            x: (i % columns) * cell_width,
            y: (i / columns) * cell_height,
            width: cell_width,
            height: cell_height,
        })
        .collect()
}

/// Largest rectangle with the aspect ratio of a `width`x`height` picture that
/// fits in `cell`, centered
pub fn fit(width: u32, height: u32, cell: Cell) -> Cell {
    if width == 0 || height == 0 || cell.width == 0 || cell.height == 0 {
        return Cell {
            width: 0,
            height: 0,
            ..cell
        };
    }
    let scale = f64::min(
        cell.width as f64 / width as f64,
        cell.height as f64 / height as f64,
    );
    let fitted_width = ((width as f64 * scale).round() as u32).clamp(1, cell.width);
    let fitted_height = ((height as f64 * scale).round() as u32).clamp(1, cell.height);
    Cell {
        x: cell.x + (cell.width - fitted_width) / 2,
        y: cell.y + (cell.height - fitted_height) / 2,
        width: fitted_width,
        height: fitted_height,
    }
}
