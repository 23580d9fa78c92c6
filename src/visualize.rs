//! Debug grid of the query and its top-ranked candidates.

use image::{imageops::FilterType, Rgb, RgbImage};
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::types::RetrievalBundle;

const COLUMNS: u32 = 3;
const ROWS: u32 = 2;
const LINE_WIDTH: u32 = 5;
const LINE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Label colours per slot: red, green, blue, brown, purple, orange
const LABEL_COLORS: [Rgb<u8>; 6] = [
    Rgb([255, 0, 0]),
    Rgb([0, 128, 0]),
    Rgb([0, 0, 255]),
    Rgb([165, 42, 42]),
    Rgb([128, 0, 128]),
    Rgb([255, 165, 0]),
];

/// Compose the masked query (labelled "src") and up to five masked
/// candidates (numbered from 1) into a 3x2 grid with red separators.
pub fn compose_grid(bundle: &RetrievalBundle) -> RgbImage {
    let query = &bundle.query.masked_image;
    let (cell_w, cell_h) = (query.width().max(1), query.height().max(1));
    let mut canvas = RgbImage::from_pixel(cell_w * COLUMNS, cell_h * ROWS, Rgb([255, 255, 255]));

    let tiles = std::iter::once(query).chain(
        bundle
            .candidates
            .iter()
            .map(|c| &c.masked_image)
            .take((COLUMNS * ROWS - 1) as usize),
    );

    let scale = (cell_h / 10 / GLYPH_HEIGHT).max(1);
    for (index, tile) in tiles.enumerate() {
        let index = index as u32;
        let resized = image::imageops::resize(tile, cell_w, cell_h, FilterType::Triangle);
        let x = index % COLUMNS * cell_w;
        let y = index / COLUMNS * cell_h;
        image::imageops::replace(&mut canvas, &resized, x as i64, y as i64);

        let label = if index == 0 {
            "src".to_string()
        } else {
            index.to_string()
        };
        draw_text(
            &mut canvas,
            &label,
            x + cell_w / 20,
            y + cell_h / 20,
            scale,
            LABEL_COLORS[index as usize],
        );
    }

    for i in 1..COLUMNS {
        fill_rect(
            &mut canvas,
            (i * cell_w).saturating_sub(LINE_WIDTH / 2),
            0,
            LINE_WIDTH,
            cell_h * ROWS,
            LINE_COLOR,
        );
    }
    for i in 1..ROWS {
        fill_rect(
            &mut canvas,
            0,
            (i * cell_h).saturating_sub(LINE_WIDTH / 2),
            cell_w * COLUMNS,
            LINE_WIDTH,
            LINE_COLOR,
        );
    }

    canvas
}

/// Compose the grid and write it to `path`
pub fn save_grid(bundle: &RetrievalBundle, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    compose_grid(bundle).save(path)?;
    info!("Saved retrieval visualization to {}", path.display());
    Ok(())
}

fn fill_rect(canvas: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    let x_end = (x + w).min(canvas.width());
    let y_end = (y + h).min(canvas.height());
    for py in y..y_end {
        for px in x..x_end {
            canvas.put_pixel(px, py, color);
        }
    }
}

const GLYPH_WIDTH: u32 = 3;
const GLYPH_HEIGHT: u32 = 5;

/// 3x5 bitmaps, one row per byte, high bit on the left
fn glyph(c: char) -> Option<[u8; 5]> {
    Some(match c {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b010, 0b010, 0b010],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        's' => [0b000, 0b111, 0b110, 0b011, 0b111],
        'r' => [0b000, 0b110, 0b101, 0b100, 0b100],
        'c' => [0b000, 0b111, 0b100, 0b100, 0b111],
        _ => return None,
    })
}

fn draw_text(canvas: &mut RgbImage, text: &str, x: u32, y: u32, scale: u32, color: Rgb<u8>) {
    let mut cursor = x;
    for c in text.chars() {
        if let Some(rows) = glyph(c) {
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if bits & (1 << (GLYPH_WIDTH - 1 - col)) != 0 {
                        fill_rect(
                            canvas,
                            cursor + col * scale,
                            y + row as u32 * scale,
                            scale,
                            scale,
                            color,
                        );
                    }
                }
            }
        }
        cursor += (GLYPH_WIDTH + 1) * scale;
    }
}
