//! Deep Zoom `.dzi` descriptor

use super::{EncodeError, TileFormat};

const DZI_NAMESPACE: &str = "http://schemas.microsoft.com/deepzoom/2008";

/// Contents of a `.dzi` file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DziDescriptor {
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    pub overlap: u32,
    pub format: TileFormat,
}

impl DziDescriptor {
    pub fn to_xml(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <Image xmlns=\"{ns}\" Format=\"{format}\" \
             Overlap=\"{overlap}\" TileSize=\"{tile}\">\n  \
             <Size Height=\"{height}\" Width=\"{width}\"/>\n\
             </Image>\n",
            ns = DZI_NAMESPACE,
            format = self.format.extension(),
            overlap = self.overlap,
            tile = self.tile_size,
            height = self.height,
            width = self.width,
        )
    }

    /// Reads the attributes back out of a descriptor.
    ///
    /// Only the attributes this crate writes are understood; anything else in
    /// the document is ignored.
    pub fn parse(xml: &str) -> Result<Self, EncodeError> {
        let format_ext = attribute(xml, "Format")?;
        let format = TileFormat::from_extension(format_ext).ok_or_else(|| {
            EncodeError::InvalidDescriptor(format!("unsupported tile format '{format_ext}'"))
        })?;

        Ok(Self {
            width: numeric_attribute(xml, "Width")?,
            height: numeric_attribute(xml, "Height")?,
            tile_size: numeric_attribute(xml, "TileSize")?,
            overlap: numeric_attribute(xml, "Overlap")?,
            format,
        })
    }
}

fn attribute<'a>(xml: &'a str, name: &str) -> Result<&'a str, EncodeError> {
    let needle = format!(" {name}=\"");
    let start = xml
        .find(&needle)
        .map(|idx| idx + needle.len())
        .ok_or_else(|| EncodeError::InvalidDescriptor(format!("missing {name} attribute")))?;
    let len = xml[start..]
        .find('"')
        .ok_or_else(|| EncodeError::InvalidDescriptor(format!("unterminated {name} attribute")))?;
    Ok(&xml[start..start + len])
}

fn numeric_attribute(xml: &str, name: &str) -> Result<u32, EncodeError> {
    let raw = attribute(xml, name)?;
    raw.parse()
        .map_err(|_| EncodeError::InvalidDescriptor(format!("{name}=\"{raw}\" is not a number")))
}
