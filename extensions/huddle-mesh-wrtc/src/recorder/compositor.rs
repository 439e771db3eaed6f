use std::collections::BTreeMap;
use std::sync::Arc;

use huddle::media::{MediaStream, MediaTrack};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

use super::layout;

/// One picture source on the canvas
#[derive(Debug, Clone)]
pub struct Tile {
    pub participant_id: String,
    pub track: Arc<MediaTrack>,
    /// Drawn flipped horizontally, like a self view
    pub mirrored: bool,
}

impl Tile {
    fn drawable(&self) -> Option<RgbaImage> {
        if !self.track.is_live() || !self.track.is_enabled() {
            return None;
        }
        let frame = self.track.latest_frame()?;
        if frame.is_empty() {
            return None;
        }
        RgbaImage::from_raw(frame.width, frame.height, frame.data.to_vec())
    }
}

/// Local video first, then every remote video ordered by participant id
pub fn collect_tiles(
    local_id: &str,
    local: Option<&MediaStream>,
    remotes: &BTreeMap<String, MediaStream>,
) -> Vec<Tile> {
    let mut tiles = vec![];
    if let Some(track) = local.and_then(|s| s.video_tracks().next()) {
        tiles.push(Tile {
            participant_id: local_id.to_string(),
            track: track.clone(),
            mirrored: true,
        });
    }
    for (id, stream) in remotes {
        if !stream.is_active() {
            continue;
        }
        if let Some(track) = stream.video_tracks().next() {
            tiles.push(Tile {
                participant_id: id.clone(),
                track: track.clone(),
                mirrored: false,
            });
        }
    }
    tiles
}

/// Fixed size drawing surface the grid is painted on
pub struct Compositor {
    canvas: RgbaImage,
}

impl Compositor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            canvas: RgbaImage::from_pixel(width.max(1), height.max(1), Rgba([0, 0, 0, 255])),
        }
    }

    pub fn canvas(&self) -> &RgbaImage {
        &self.canvas
    }

    /// Clears the canvas and draws every tile that currently has a picture.
    /// Returns the number of tiles drawn.
    pub fn compose(&mut self, tiles: &[Tile]) -> usize {
        for pixel in self.canvas.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 255]);
        }

        let pictures = tiles
            .iter()
            .filter_map(|tile| tile.drawable().map(|picture| (tile, picture)))
            .collect::<Vec<_>>();
        let cells = layout::grid(pictures.len(), self.canvas.width(), self.canvas.height());

        for ((tile, picture), cell) in pictures.iter().zip(cells) {
            let target = layout::fit(picture.width(), picture.height(), cell);
            if target.width == 0 || target.height == 0 {
                continue;
            }
            let mut scaled = imageops::resize(picture, target.width, target.height, FilterType::Triangle);
            if tile.mirrored {
                imageops::flip_horizontal_in_place(&mut scaled);
            }
            imageops::replace(&mut self.canvas, &scaled, target.x as i64, target.y as i64);
        }
        pictures.len()
    }
}
