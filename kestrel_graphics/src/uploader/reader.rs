use std::path::Path;

use ash::vk;

use super::promise::UploadError;

#[derive(Clone, Debug)]
pub struct ImageReaderInfo {
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: vk::Format,
    pub whole_size: u64,
}

/// Location of a block streamed out by a reader, mirrored into a
/// `VkBufferImageCopy2` region by the uploader. `write_offset` is relative
/// to the staging view the block was written into.
#[derive(Clone, Debug)]
pub struct ImageBlockInfo {
    pub write_offset: u64,
    pub mip_level: u32,
    pub array_layer: u32,
    pub layer_count: u32,
    pub extent: vk::Extent3D,
}

pub enum ReadBlock {
    Block(ImageBlockInfo),
    EndOfStream,
}

/// Streams decoded image data into staging memory, one mip/layer block at a
/// time.
pub trait ImageReader: Send {
    fn info(&self) -> &ImageReaderInfo;

    /// Writes the next block into `dst` starting at `*cursor` and advances
    /// the cursor past it.
    fn read_next_block(
        &mut self,
        dst: &mut [u8],
        cursor: &mut u64,
    ) -> Result<ReadBlock, UploadError>;
}

/// Opens a reader for the file format at `path`. Currently everything goes
/// through the `image` crate, which decodes to a single RGBA8 block.
pub fn open_image_reader(path: &Path) -> Result<Box<dyn ImageReader>, UploadError> {
    let reader = DecodedImageReader::open(path)?;
    Ok(Box::new(reader))
}

struct DecodedImageReader {
    info: ImageReaderInfo,
    pixels: Vec<u8>,
    consumed: bool,
}

impl DecodedImageReader {
    fn open(path: &Path) -> Result<Self, UploadError> {
        let decoded = image::open(path).map_err(|error| match error {
            image::ImageError::IoError(io) => UploadError::Open(io.to_string()),
            other => UploadError::Header(other.to_string()),
        })?;

        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        let pixels = rgba.into_raw();

        Ok(Self {
            info: ImageReaderInfo {
                extent: vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                },
                mip_levels: 1,
                array_layers: 1,
                format: vk::Format::R8G8B8A8_SRGB,
                whole_size: pixels.len() as u64,
            },
            pixels,
            consumed: false,
        })
    }
}

impl ImageReader for DecodedImageReader {
    fn info(&self) -> &ImageReaderInfo {
        &self.info
    }

    fn read_next_block(
        &mut self,
        dst: &mut [u8],
        cursor: &mut u64,
    ) -> Result<ReadBlock, UploadError> {
        if self.consumed {
            return Ok(ReadBlock::EndOfStream);
        }

        let offset = *cursor as usize;
        let end = offset + self.pixels.len();
        if end > dst.len() {
            return Err(UploadError::Read);
        }
        dst[offset..end].copy_from_slice(&self.pixels);

        let block = ImageBlockInfo {
            write_offset: *cursor,
            mip_level: 0,
            array_layer: 0,
            layer_count: 1,
            extent: self.info.extent,
        };
        *cursor += self.pixels.len() as u64;
        self.consumed = true;

        Ok(ReadBlock::Block(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reports_open_error() {
        let result = open_image_reader(Path::new("/nonexistent/kestrel-test.png"));
        assert!(matches!(result, Err(UploadError::Open(_))));
    }

    #[test]
    fn decoded_reader_streams_one_block() {
        let path = std::env::temp_dir().join("kestrel_reader_test.png");
        let image = image::RgbaImage::from_pixel(2, 2, image::Rgba([255, 0, 0, 255]));
        image.save(&path).unwrap();

        let mut reader = open_image_reader(&path).unwrap();
        assert_eq!(reader.info().extent.width, 2);
        assert_eq!(reader.info().whole_size, 16);
        assert_eq!(reader.info().format, vk::Format::R8G8B8A8_SRGB);

        let mut dst = vec![0u8; 16];
        let mut cursor = 0;
        let block = reader.read_next_block(&mut dst, &mut cursor).unwrap();
        match block {
            ReadBlock::Block(block) => {
                assert_eq!(block.write_offset, 0);
                assert_eq!(block.extent.width, 2);
            }
            ReadBlock::EndOfStream => panic!("expected a block"),
        }
        assert_eq!(cursor, 16);
        assert_eq!(&dst[0..4], &[255, 0, 0, 255]);

        assert!(matches!(
            reader.read_next_block(&mut dst, &mut cursor).unwrap(),
            ReadBlock::EndOfStream
        ));

        std::fs::remove_file(&path).ok();
    }
}
