use crate::config::RedactionOptions;
use crate::error::IngestError;
use crate::traits::PageRenderer;
use image::codecs::jpeg::JpegEncoder;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

const REDACTED_IMAGE_NAME: &[u8] = b"Redacted";
const JPEG_QUALITY: u8 = 80;

pub fn page_count(document: &[u8]) -> Result<u32, IngestError> {
    let document = Document::load_mem(document)?;
    Ok(document.get_pages().len() as u32)
}

/// Replaces selected pages with a blurred, low-resolution raster of themselves.
pub struct Redactor {
    renderer: Arc<dyn PageRenderer>,
    options: RedactionOptions,
}

impl Redactor {
    pub fn new(renderer: Arc<dyn PageRenderer>, options: RedactionOptions) -> Self {
        Self { renderer, options }
    }

    /// Returns a new document; `document` itself is never modified.
    /// Page count and order are preserved and unlisted pages are left untouched.
    pub async fn redact(&self, document: &[u8], pages: &[u32]) -> Result<Vec<u8>, IngestError> {
        let mut pdf = Document::load_mem(document)?;
        let page_ids = pdf.get_pages();
        let total_pages = page_ids.len() as u32;

        let requested: BTreeSet<u32> = pages.iter().copied().collect();
        if let Some(page) = requested
            .iter()
            .find(|&&page| page == 0 || page > total_pages)
        {
            return Err(IngestError::Validation(format!(
                "cannot redact page {page} of a {total_pages}-page document"
            )));
        }

        for page_number in requested {
            let Some(&page_id) = page_ids.get(&page_number) else {
                continue;
            };
            let raster = self
                .renderer
                .render_page(document, page_number, self.options.dpi)
                .await?;
            let blurred = raster.blur(self.options.blur_sigma).to_rgb8();

            let mut jpeg = Vec::new();
            JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode_image(&blurred)?;

            let bounds = media_box(&pdf, page_id)?;
            replace_page_content(&mut pdf, page_id, bounds, blurred.width(), blurred.height(), jpeg)?;
            debug!(page_number, width = blurred.width(), height = blurred.height(), "page redacted");
        }

        pdf.prune_objects();
        let mut output = Vec::new();
        pdf.save_to(&mut output)?;
        Ok(output)
    }
}

fn replace_page_content(
    pdf: &mut Document,
    page_id: ObjectId,
    [x0, y0, x1, y1]: [f32; 4],
    width: u32,
    height: u32,
    jpeg: Vec<u8>,
) -> Result<(), IngestError> {
    let image_id = pdf.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(width),
            "Height" => i64::from(height),
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "Filter" => "DCTDecode",
        },
        jpeg,
    ));

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    (x1 - x0).into(),
                    Object::Integer(0),
                    Object::Integer(0),
                    (y1 - y0).into(),
                    x0.into(),
                    y0.into(),
                ],
            ),
            Operation::new("Do", vec![Object::Name(REDACTED_IMAGE_NAME.to_vec())]),
            Operation::new("Q", vec![]),
        ],
    };
    let content_id = pdf.add_object(Stream::new(dictionary! {}, content.encode()?));

    let page = pdf.get_object_mut(page_id)?.as_dict_mut()?;
    page.set("Contents", content_id);
    page.set(
        "Resources",
        dictionary! {
            "XObject" => dictionary! {
                "Redacted" => image_id,
            },
        },
    );
    page.remove(b"Annots");
    Ok(())
}

/// The page's MediaBox, following inheritance through the page tree.
fn media_box(pdf: &Document, page_id: ObjectId) -> Result<[f32; 4], IngestError> {
    let mut node = pdf.get_dictionary(page_id)?;
    for _ in 0..32 {
        if let Ok(object) = node.get(b"MediaBox") {
            let array = match object {
                Object::Reference(id) => pdf.get_object(*id)?.as_array()?,
                other => other.as_array()?,
            };
            if array.len() != 4 {
                return Err(IngestError::Pdf(format!(
                    "MediaBox has {} entries",
                    array.len()
                )));
            }
            let mut bounds = [0f32; 4];
            for (slot, value) in bounds.iter_mut().zip(array) {
                *slot = value.as_float()?;
            }
            return Ok(bounds);
        }
        let parent = node.get(b"Parent")?.as_reference()?;
        node = pdf.get_dictionary(parent)?;
    }
    Err(IngestError::Pdf(format!(
        "page tree above {page_id:?} is too deep to resolve MediaBox"
    )))
}
