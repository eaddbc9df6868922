use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::CompositeError;

/// Fill colour of canvas area no source covers.
pub const NEUTRAL_GREY: Rgb<u8> = Rgb([128, 128, 128]);

/// Grid placement shared by stitching, describing and extracting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub columns: u32,
    pub rows: u32,
    pub cell_width: u32,
    pub cell_height: u32,
    pub count: usize,
}

impl Layout {
    pub fn for_count(count: usize, canvas_size: u32) -> Result<Self, CompositeError> {
        if count == 0 {
            return Err(CompositeError::EmptyInput);
        }
        let (columns, rows) = grid_for(count);
        let cell_width = canvas_size / columns;
        let cell_height = canvas_size / rows;
        if cell_width == 0 || cell_height == 0 {
            return Err(CompositeError::Dimension(format!(
                "canvas of {canvas_size}px cannot hold a {columns}x{rows} grid"
            )));
        }
        Ok(Self {
            columns,
            rows,
            cell_width,
            cell_height,
            count,
        })
    }

    /// `(column, row)` of the `index`-th source, row-major.
    pub fn position(&self, index: usize) -> (u32, u32) {
        let index = index as u32;
        (index % self.columns, index / self.columns)
    }

    /// Top-left pixel of the `index`-th cell.
    pub fn origin(&self, index: usize) -> (u32, u32) {
        let (column, row) = self.position(index);
        (column * self.cell_width, row * self.cell_height)
    }
}

fn grid_for(count: usize) -> (u32, u32) {
    match count {
        1 => (1, 1),
        2 => (2, 1),
        3 => (3, 1),
        4 => (2, 2),
        5 | 6 => (3, 2),
        7..=9 => (3, 3),
        _ => (4, count.div_ceil(4) as u32),
    }
}

/// Tiles `images` onto a square `canvas_size` canvas. Each source is scaled
/// to cover its cell and centre-cropped.
pub fn stitch(
    images: &[DynamicImage],
    canvas_size: u32,
) -> Result<(DynamicImage, Layout), CompositeError> {
    let layout = Layout::for_count(images.len(), canvas_size)?;
    let mut canvas = RgbImage::from_pixel(canvas_size, canvas_size, NEUTRAL_GREY);
    for (index, source) in images.iter().enumerate() {
        let (width, height) = source.dimensions();
        if width == 0 || height == 0 {
            return Err(CompositeError::Dimension(format!(
                "source image {index} is {width}x{height}"
            )));
        }
        let cell = source
            .resize_to_fill(layout.cell_width, layout.cell_height, FilterType::Lanczos3)
            .to_rgb8();
        let (x, y) = layout.origin(index);
        imageops::replace(&mut canvas, &cell, i64::from(x), i64::from(y));
    }
    Ok((DynamicImage::ImageRgb8(canvas), layout))
}

/// Plain-text mapping of grid cells to the people in them.
pub fn describe_layout(layout: &Layout, labels: &[String]) -> String {
    let label_at = |index: usize| {
        labels
            .get(index)
            .map(|label| label.trim())
            .filter(|label| !label.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("person {}", index + 1))
    };

    if layout.count == 1 {
        return format!("The image shows a single person: {}.", label_at(0));
    }

    let mut lines = vec![format!(
        "The image is a {}x{} grid of {} people, read left to right, top to bottom.",
        layout.columns, layout.rows, layout.count
    )];
    for index in 0..layout.count {
        let (column, row) = layout.position(index);
        lines.push(format!(
            "Row {}, column {}: {}.",
            row + 1,
            column + 1,
            label_at(index)
        ));
    }
    lines.join("\n")
}

/// Returns the middle panel of a horizontal strip of `total_panels` panels.
pub fn extract_center_panel(
    image: &DynamicImage,
    total_panels: u32,
) -> Result<DynamicImage, CompositeError> {
    if total_panels < 1 {
        return Err(CompositeError::InvalidPanelCount(total_panels));
    }
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(CompositeError::Dimension(format!(
            "image is {width}x{height}"
        )));
    }
    if total_panels == 1 {
        return Ok(image.clone());
    }
    let panel_width = width / total_panels;
    if panel_width == 0 {
        return Err(CompositeError::Dimension(format!(
            "{width}px is too narrow for {total_panels} panels"
        )));
    }
    let index = total_panels / 2;
    Ok(image.crop_imm(index * panel_width, 0, panel_width, height))
}

/// Lays `images` side by side, each fitted to the first image's size.
pub fn stitch_horizontal(images: &[DynamicImage]) -> Result<DynamicImage, CompositeError> {
    let Some(first) = images.first() else {
        return Err(CompositeError::EmptyInput);
    };
    let (panel_width, panel_height) = first.dimensions();
    if panel_width == 0 || panel_height == 0 {
        return Err(CompositeError::Dimension(format!(
            "first panel is {panel_width}x{panel_height}"
        )));
    }
    let total_width = u32::try_from(images.len())
        .ok()
        .and_then(|count| count.checked_mul(panel_width))
        .ok_or_else(|| {
            CompositeError::Dimension(format!("{} panels do not fit one strip", images.len()))
        })?;

    let mut strip = RgbImage::from_pixel(total_width, panel_height, NEUTRAL_GREY);
    for (index, panel) in images.iter().enumerate() {
        let fitted = if panel.dimensions() == (panel_width, panel_height) {
            panel.to_rgb8()
        } else {
            panel
                .resize_to_fill(panel_width, panel_height, FilterType::Lanczos3)
                .to_rgb8()
        };
        let x = index as i64 * i64::from(panel_width);
        imageops::replace(&mut strip, &fitted, x, 0);
    }
    Ok(DynamicImage::ImageRgb8(strip))
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, CompositeError> {
    Ok(image::load_from_memory(bytes)?)
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, CompositeError> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

    use super::{
        decode, describe_layout, encode_png, extract_center_panel, stitch, stitch_horizontal,
        Layout, NEUTRAL_GREY,
    };
    use crate::error::CompositeError;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(rgb)))
    }

    fn pixel(image: &DynamicImage, x: u32, y: u32) -> [u8; 3] {
        let rgba = image.get_pixel(x, y).0;
        [rgba[0], rgba[1], rgba[2]]
    }

    #[test]
    fn four_sources_fill_a_two_by_two_grid() -> anyhow::Result<()> {
        let colours = [[255, 0, 0], [0, 255, 0], [0, 0, 255], [255, 255, 0]];
        let sources: Vec<_> = colours
            .iter()
            .map(|rgb| solid(300, 200, *rgb))
            .collect();
        let (canvas, layout) = stitch(&sources, 1024)?;

        assert_eq!(canvas.dimensions(), (1024, 1024));
        assert_eq!((layout.columns, layout.rows), (2, 2));
        assert_eq!((layout.cell_width, layout.cell_height), (512, 512));
        assert_eq!(layout.origin(1), (512, 0));
        assert_eq!(layout.origin(2), (0, 512));
        assert_eq!(pixel(&canvas, 10, 10), colours[0]);
        assert_eq!(pixel(&canvas, 600, 10), colours[1]);
        assert_eq!(pixel(&canvas, 10, 600), colours[2]);
        assert_eq!(pixel(&canvas, 1000, 1000), colours[3]);
        Ok(())
    }

    #[test]
    fn grid_always_holds_every_source() -> anyhow::Result<()> {
        for count in 1..=20usize {
            let layout = Layout::for_count(count, 1024)?;
            let cells = (layout.columns * layout.rows) as usize;
            assert!(cells >= count, "{count} sources in {cells} cells");
            assert!(
                cells - count < layout.columns as usize,
                "{count} sources leave a whole row of {cells} cells empty"
            );
            let (last_column, last_row) = layout.position(count - 1);
            assert!(last_column < layout.columns && last_row < layout.rows);
            let (x, y) = layout.origin(count - 1);
            assert!(x + layout.cell_width <= 1024 && y + layout.cell_height <= 1024);
        }
        assert_eq!(Layout::for_count(5, 1024)?.columns, 3);
        assert_eq!(Layout::for_count(10, 1024)?.rows, 3);
        Ok(())
    }

    #[test]
    fn stitched_canvas_is_square_for_every_count() -> anyhow::Result<()> {
        for count in 1..=20usize {
            let sources = vec![solid(7, 5, [200, 10, 10]); count];
            let (canvas, layout) = stitch(&sources, 240)?;
            assert_eq!(canvas.dimensions(), (240, 240), "{count} sources");
            assert_eq!(layout.count, count);
            let (x, y) = layout.origin(count - 1);
            assert_eq!(pixel(&canvas, x, y), [200, 10, 10], "{count} sources");
        }
        Ok(())
    }

    #[test]
    fn unused_area_stays_grey() -> anyhow::Result<()> {
        let sources = vec![solid(64, 64, [10, 20, 30]); 3];
        let (canvas, layout) = stitch(&sources, 1024)?;
        assert_eq!(layout.cell_width, 341);
        assert_eq!(pixel(&canvas, 1023, 500), NEUTRAL_GREY.0);

        let sources = vec![solid(64, 64, [10, 20, 30]); 5];
        let (canvas, _) = stitch(&sources, 300)?;
        assert_eq!(pixel(&canvas, 250, 250), NEUTRAL_GREY.0);
        Ok(())
    }

    #[test]
    fn stitch_rejects_empty_input_and_tiny_canvas() {
        assert!(matches!(stitch(&[], 1024), Err(CompositeError::EmptyInput)));
        let sources = vec![solid(4, 4, [0, 0, 0]); 4];
        assert!(matches!(
            stitch(&sources, 1),
            Err(CompositeError::Dimension(_))
        ));
    }

    #[test]
    fn center_panel_round_trips_through_a_strip() -> anyhow::Result<()> {
        let left = solid(40, 30, [200, 0, 0]);
        let front = solid(40, 30, [0, 200, 0]);
        let right = solid(40, 30, [0, 0, 200]);
        let strip = stitch_horizontal(&[left, front.clone(), right])?;
        assert_eq!(strip.dimensions(), (120, 30));

        let center = extract_center_panel(&strip, 3)?;
        assert_eq!(center.dimensions(), front.dimensions());
        assert_eq!(center.to_rgb8(), front.to_rgb8());
        Ok(())
    }

    #[test]
    fn single_panel_is_returned_unchanged() -> anyhow::Result<()> {
        let image = solid(17, 9, [1, 2, 3]);
        assert_eq!(extract_center_panel(&image, 1)?, image);
        Ok(())
    }

    #[test]
    fn extract_validates_panel_count_and_width() {
        let image = solid(2, 2, [0, 0, 0]);
        assert!(matches!(
            extract_center_panel(&image, 0),
            Err(CompositeError::InvalidPanelCount(0))
        ));
        assert!(matches!(
            extract_center_panel(&image, 3),
            Err(CompositeError::Dimension(_))
        ));
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(matches!(
            extract_center_panel(&empty, 3),
            Err(CompositeError::Dimension(_))
        ));
    }

    #[test]
    fn describe_layout_labels_cells() -> anyhow::Result<()> {
        let single = Layout::for_count(1, 1024)?;
        assert_eq!(
            describe_layout(&single, &["Grandma Rose".to_string()]),
            "The image shows a single person: Grandma Rose."
        );

        let grid = Layout::for_count(3, 1024)?;
        let text = describe_layout(&grid, &["Ana".to_string(), " ".to_string()]);
        assert!(text.starts_with("The image is a 3x1 grid of 3 people"));
        assert!(text.contains("Row 1, column 1: Ana."));
        assert!(text.contains("Row 1, column 2: person 2."));
        assert!(text.contains("Row 1, column 3: person 3."));
        Ok(())
    }

    #[test]
    fn png_codec_round_trip_and_garbage_input() -> anyhow::Result<()> {
        let image = solid(8, 8, [9, 8, 7]);
        let decoded = decode(&encode_png(&image)?)?;
        assert_eq!(decoded.to_rgb8(), image.to_rgb8());
        assert!(matches!(decode(b"not an image"), Err(CompositeError::Codec(_))));
        Ok(())
    }
}
