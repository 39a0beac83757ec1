//! Page rasterization for the OCR fallback
//!
//! [`PdftoppmRasterizer`] renders pages with poppler's `pdftoppm`, so rotated
//! pages, CCITT/JBIG2/JPX scans and vector labels all come out the way a
//! viewer shows them. Plain scans whose only content is one image covering
//! the page box take the [`EmbeddedImageRasterizer`] path instead, which
//! decodes the image directly and skips the external process.

use crate::document::{inherited_attribute, named_xobject, page_resources, resolve, SourceDocument};
use flate2::read::ZlibDecoder;
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageFormat, Luma};
use log::debug;
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::io::Read;
use std::path::PathBuf;
use std::process::Command;

/// Largest bitmap side we will allocate
const MAX_RENDER_SIDE: u32 = 10_000;
/// PDF user space units per inch
const POINTS_PER_INCH: f32 = 72.0;

const IDENTITY: [f32; 6] = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    #[error("page {0} does not exist")]
    MissingPage(usize),
    #[error("page has no image to rasterize")]
    NoImage,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("renderer unavailable: {0}")]
    Unavailable(String),
    #[error("render failed: {0}")]
    Render(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Renders one page of a source document to a grayscale bitmap
pub trait PageRasterizer {
    fn render(
        &self,
        document: &SourceDocument,
        page_index: usize,
        scale: f32,
    ) -> Result<GrayImage, RasterError>;
}

/// Rasterizer for plain scans backed by their embedded image.
///
/// Only pages that paint exactly one image over the whole page box (and
/// nothing else) are accepted; anything else is [`RasterError::Unsupported`].
/// `/Rotate` is applied to the result.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedImageRasterizer;

impl PageRasterizer for EmbeddedImageRasterizer {
    fn render(
        &self,
        document: &SourceDocument,
        page_index: usize,
        scale: f32,
    ) -> Result<GrayImage, RasterError> {
        let doc = document.lopdf();
        let page_id = document
            .page_id(page_index)
            .ok_or(RasterError::MissingPage(page_index))?;

        let page = page_box(doc, page_id)
            .ok_or_else(|| RasterError::Unsupported("page has no usable MediaBox".to_string()))?;
        let stream = full_page_image(doc, page_id, &page)?;
        let bitmap = decode_image_stream(doc, stream)?;

        let (width, height) = (scaled_side(page.width, scale), scaled_side(page.height, scale));
        let bitmap = if (width, height) == bitmap.dimensions() {
            bitmap
        } else {
            imageops::resize(&bitmap, width, height, FilterType::Triangle)
        };

        rotate(bitmap, page_rotation(doc, page_id))
    }
}

/// Renders pages by running poppler's `pdftoppm`
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    binary: PathBuf,
    embedded_fast_path: bool,
}

impl Default for PdftoppmRasterizer {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("pdftoppm"),
            embedded_fast_path: true,
        }
    }
}

impl PdftoppmRasterizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Run `pdftoppm` for every page, plain scans included
    pub fn without_fast_path(mut self) -> Self {
        self.embedded_fast_path = false;
        self
    }

    fn run_pdftoppm(
        &self,
        document: &SourceDocument,
        page_index: usize,
        scale: f32,
    ) -> Result<GrayImage, RasterError> {
        let pdf = document
            .spooled_path()
            .map_err(|e| RasterError::Render(format!("cannot spool {}: {e}", document.name())))?;

        let mut dpi = POINTS_PER_INCH * scale;
        if let Some(page) = document
            .page_id(page_index)
            .and_then(|id| page_box(document.lopdf(), id))
        {
            let longest = page.width.max(page.height);
            dpi = dpi.min(POINTS_PER_INCH * MAX_RENDER_SIDE as f32 / longest);
        }
        let dpi = dpi.round().max(1.0);

        let scratch = tempfile::Builder::new().prefix("waybill-render-").tempdir()?;
        let prefix = scratch.path().join("page");
        let page_number = (page_index + 1).to_string();

        let output = Command::new(&self.binary)
            .arg("-f")
            .arg(&page_number)
            .arg("-l")
            .arg(&page_number)
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-gray")
            .arg("-singlefile")
            .arg("-png")
            .arg(pdf)
            .arg(&prefix)
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RasterError::Unavailable(format!("{} not found", self.binary.display()))
                } else {
                    RasterError::Io(e)
                }
            })?;

        if !output.status.success() {
            return Err(RasterError::Render(format!(
                "pdftoppm exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let png = prefix.with_extension("png");
        let bitmap = image::open(&png)
            .map_err(|e| RasterError::Decode(format!("cannot read {}: {e}", png.display())))?;
        Ok(bitmap.to_luma8())
    }
}

impl PageRasterizer for PdftoppmRasterizer {
    fn render(
        &self,
        document: &SourceDocument,
        page_index: usize,
        scale: f32,
    ) -> Result<GrayImage, RasterError> {
        if document.page_id(page_index).is_none() {
            return Err(RasterError::MissingPage(page_index));
        }

        if self.embedded_fast_path {
            match EmbeddedImageRasterizer.render(document, page_index, scale) {
                Ok(bitmap) => return Ok(bitmap),
                Err(e) => debug!(
                    "{} page {}: {e}, rendering with pdftoppm",
                    document.name(),
                    page_index + 1
                ),
            }
        }

        self.run_pdftoppm(document, page_index, scale)
    }
}

/// Keep the top `percent` of a bitmap (at least one row)
pub fn crop_top(image: &GrayImage, percent: u8) -> GrayImage {
    let band = (u64::from(image.height()) * u64::from(percent)).div_ceil(100);
    let band = (band as u32).clamp(1, image.height().max(1));
    imageops::crop_imm(image, 0, 0, image.width(), band).to_image()
}

fn scaled_side(points: f32, scale: f32) -> u32 {
    ((points * scale).round() as u32).clamp(1, MAX_RENDER_SIDE)
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r),
        _ => None,
    }
}

/// The visible page area in user space
#[derive(Debug, Clone, Copy, PartialEq)]
struct PageBox {
    x0: f32,
    y0: f32,
    width: f32,
    height: f32,
}

/// CropBox if the page has one, else MediaBox
fn page_box(doc: &Document, page_id: ObjectId) -> Option<PageBox> {
    let rect = inherited_attribute(doc, page_id, b"CropBox")
        .or_else(|| inherited_attribute(doc, page_id, b"MediaBox"))?;
    let values: Vec<f32> = resolve(doc, rect)
        .as_array()
        .ok()?
        .iter()
        .filter_map(|o| number(resolve(doc, o)))
        .collect();
    if values.len() != 4 {
        return None;
    }
    let page = PageBox {
        x0: values[0].min(values[2]),
        y0: values[1].min(values[3]),
        width: (values[2] - values[0]).abs(),
        height: (values[3] - values[1]).abs(),
    };
    (page.width > 0.0 && page.height > 0.0).then_some(page)
}

/// Clockwise display rotation in degrees, normalized to 0..360
fn page_rotation(doc: &Document, page_id: ObjectId) -> i64 {
    inherited_attribute(doc, page_id, b"Rotate")
        .and_then(|o| resolve(doc, o).as_i64().ok())
        .unwrap_or(0)
        .rem_euclid(360)
}

fn rotate(bitmap: GrayImage, degrees: i64) -> Result<GrayImage, RasterError> {
    match degrees {
        0 => Ok(bitmap),
        90 => Ok(imageops::rotate90(&bitmap)),
        180 => Ok(imageops::rotate180(&bitmap)),
        270 => Ok(imageops::rotate270(&bitmap)),
        other => Err(RasterError::Unsupported(format!("Rotate {other}"))),
    }
}

fn matrix(operands: &[Object]) -> Result<[f32; 6], RasterError> {
    let values: Vec<f32> = operands.iter().filter_map(number).collect();
    <[f32; 6]>::try_from(values.as_slice())
        .map_err(|_| RasterError::Decode("cm needs six numbers".to_string()))
}

/// `m` applied in the space `ctm` maps to the page, as `cm` does
fn concat(m: &[f32; 6], ctm: &[f32; 6]) -> [f32; 6] {
    [
        m[0] * ctm[0] + m[1] * ctm[2],
        m[0] * ctm[1] + m[1] * ctm[3],
        m[2] * ctm[0] + m[3] * ctm[2],
        m[2] * ctm[1] + m[3] * ctm[3],
        m[4] * ctm[0] + m[5] * ctm[2] + ctm[4],
        m[4] * ctm[1] + m[5] * ctm[3] + ctm[5],
    ]
}

/// Whether an image drawn with `ctm` fills the page box upright
fn covers_page(ctm: &[f32; 6], page: &PageBox) -> bool {
    let tolerance = (page.width.max(page.height) * 0.01).max(0.5);
    let near = |a: f32, b: f32| (a - b).abs() <= tolerance;
    near(ctm[0], page.width)
        && near(ctm[1], 0.0)
        && near(ctm[2], 0.0)
        && near(ctm[3], page.height)
        && near(ctm[4], page.x0)
        && near(ctm[5], page.y0)
}

fn is_image(stream: &Stream) -> bool {
    stream
        .dict
        .get(b"Subtype")
        .and_then(Object::as_name)
        .is_ok_and(|name| name == b"Image")
}

/// The single image a plain scan paints across its page box
fn full_page_image<'a>(
    doc: &'a Document,
    page_id: ObjectId,
    page: &PageBox,
) -> Result<&'a Stream, RasterError> {
    let data = doc
        .get_page_content(page_id)
        .map_err(|e| RasterError::Decode(e.to_string()))?;
    let content = Content::decode(&data).map_err(|e| RasterError::Decode(e.to_string()))?;
    let resources = page_resources(doc, page_id).ok_or(RasterError::NoImage)?;

    let mut ctm = IDENTITY;
    let mut saved = Vec::new();
    let mut painted: Option<(&Stream, [f32; 6])> = None;

    for op in &content.operations {
        match op.operator.as_str() {
            "q" => saved.push(ctm),
            "Q" => ctm = saved.pop().unwrap_or(IDENTITY),
            "cm" => ctm = concat(&matrix(&op.operands)?, &ctm),
            "gs" => {}
            "Do" => {
                let name = op
                    .operands
                    .first()
                    .and_then(|o| o.as_name().ok())
                    .ok_or_else(|| RasterError::Decode("Do without a name".to_string()))?;
                let (_, stream) = named_xobject(doc, resources, name).ok_or(RasterError::NoImage)?;
                if !is_image(stream) {
                    return Err(RasterError::Unsupported("page paints a form".to_string()));
                }
                if painted.replace((stream, ctm)).is_some() {
                    return Err(RasterError::Unsupported(
                        "page paints several images".to_string(),
                    ));
                }
            }
            other => {
                return Err(RasterError::Unsupported(format!(
                    "page content uses {other}"
                )))
            }
        }
    }

    let (stream, ctm) = painted.ok_or(RasterError::NoImage)?;
    if !covers_page(&ctm, page) {
        return Err(RasterError::Unsupported(
            "image does not cover the page".to_string(),
        ));
    }
    Ok(stream)
}

fn image_dimensions(dict: &Dictionary) -> (u32, u32) {
    let side = |key: &[u8]| {
        dict.get(key)
            .ok()
            .and_then(|v| v.as_i64().ok())
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    };
    (side(b"Width"), side(b"Height"))
}

fn filters(dict: &Dictionary) -> Vec<Vec<u8>> {
    match dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|o| o.as_name().ok().map(<[u8]>::to_vec))
            .collect(),
        _ => Vec::new(),
    }
}

/// Decode an image XObject into an 8-bit grayscale bitmap
fn decode_image_stream(doc: &Document, stream: &Stream) -> Result<GrayImage, RasterError> {
    let filters = filters(&stream.dict);

    match filters.iter().map(Vec::as_slice).collect::<Vec<_>>().as_slice() {
        [b"DCTDecode"] => image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)
            .map(|img| img.to_luma8())
            .map_err(|e| RasterError::Decode(e.to_string())),
        [] => decode_raw_samples(doc, &stream.dict, &stream.content),
        [b"FlateDecode"] => {
            let samples = if has_predictor(&stream.dict) {
                // lopdf undoes PNG/TIFF predictors
                stream
                    .decompressed_content()
                    .map_err(|e| RasterError::Decode(e.to_string()))?
            } else {
                let mut samples = Vec::new();
                ZlibDecoder::new(stream.content.as_slice())
                    .read_to_end(&mut samples)
                    .map_err(|e| RasterError::Decode(e.to_string()))?;
                samples
            };
            decode_raw_samples(doc, &stream.dict, &samples)
        }
        other => Err(RasterError::Unsupported(
            other
                .iter()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .collect::<Vec<_>>()
                .join(","),
        )),
    }
}

fn has_predictor(dict: &Dictionary) -> bool {
    dict.get(b"DecodeParms")
        .ok()
        .and_then(|p| p.as_dict().ok())
        .and_then(|p| p.get(b"Predictor").ok())
        .and_then(|p| p.as_i64().ok())
        .is_some_and(|p| p > 1)
}

/// Number of color components for a color space entry
fn components(doc: &Document, dict: &Dictionary) -> Result<usize, RasterError> {
    let Ok(space) = dict.get(b"ColorSpace") else {
        // Image masks and JPX carry their own; raw samples need one
        return Err(RasterError::Unsupported("missing ColorSpace".to_string()));
    };

    match resolve(doc, space) {
        Object::Name(name) => match name.as_slice() {
            b"DeviceGray" | b"CalGray" | b"G" => Ok(1),
            b"DeviceRGB" | b"CalRGB" | b"RGB" => Ok(3),
            b"DeviceCMYK" | b"CMYK" => Ok(4),
            other => Err(RasterError::Unsupported(
                String::from_utf8_lossy(other).into_owned(),
            )),
        },
        Object::Array(items) => {
            let family = items.first().and_then(|o| o.as_name().ok());
            match family {
                Some(b"ICCBased") => items
                    .get(1)
                    .map(|o| resolve(doc, o))
                    .and_then(|o| o.as_stream().ok())
                    .and_then(|s| s.dict.get(b"N").ok())
                    .and_then(|n| n.as_i64().ok())
                    .and_then(|n| usize::try_from(n).ok())
                    .filter(|n| matches!(n, 1 | 3 | 4))
                    .ok_or_else(|| RasterError::Unsupported("ICCBased without N".to_string())),
                Some(b"CalGray") => Ok(1),
                Some(b"CalRGB") => Ok(3),
                Some(other) => Err(RasterError::Unsupported(
                    String::from_utf8_lossy(other).into_owned(),
                )),
                None => Err(RasterError::Unsupported("empty ColorSpace".to_string())),
            }
        }
        _ => Err(RasterError::Unsupported("ColorSpace".to_string())),
    }
}

/// Turn uncompressed samples into luma
fn decode_raw_samples(
    doc: &Document,
    dict: &Dictionary,
    samples: &[u8],
) -> Result<GrayImage, RasterError> {
    let (width, height) = image_dimensions(dict);
    if width == 0 || height == 0 || width > MAX_RENDER_SIDE || height > MAX_RENDER_SIDE {
        return Err(RasterError::Decode(format!("bad image size {width}x{height}")));
    }
    let bits = dict
        .get(b"BitsPerComponent")
        .ok()
        .and_then(|b| b.as_i64().ok())
        .unwrap_or(8);
    let comps = components(doc, dict)?;

    let (w, h) = (width as usize, height as usize);
    let row_bytes = match bits {
        8 => w * comps,
        1 if comps == 1 => w.div_ceil(8),
        other => {
            return Err(RasterError::Unsupported(format!(
                "{other} bits per component"
            )))
        }
    };
    if samples.len() < row_bytes * h {
        return Err(RasterError::Decode(format!(
            "expected {} sample bytes, found {}",
            row_bytes * h,
            samples.len()
        )));
    }

    let mut bitmap = GrayImage::new(width, height);
    for y in 0..h {
        let row = &samples[y * row_bytes..(y + 1) * row_bytes];
        for x in 0..w {
            let luma = if bits == 1 {
                if row[x / 8] & (0x80 >> (x % 8)) != 0 {
                    255
                } else {
                    0
                }
            } else {
                let px = &row[x * comps..(x + 1) * comps];
                match comps {
                    1 => px[0],
                    3 => rgb_to_luma(px[0], px[1], px[2]),
                    _ => cmyk_to_luma(px[0], px[1], px[2], px[3]),
                }
            };
            bitmap.put_pixel(x as u32, y as u32, Luma([luma]));
        }
    }

    Ok(bitmap)
}

fn rgb_to_luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b)) / 1000) as u8
}

fn cmyk_to_luma(c: u8, m: u8, y: u8, k: u8) -> u8 {
    let invert = |v: u8| 255 - u32::from(v);
    let r = invert(c) * invert(k) / 255;
    let g = invert(m) * invert(k) / 255;
    let b = invert(y) * invert(k) / 255;
    rgb_to_luma(r as u8, g as u8, b as u8)
}
