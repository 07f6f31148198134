//! Program images and the channels that carry them.
//!
//! An [`Image`] is a numbered, read-only program or data blob. A [`Channel`]
//! is a catalog entry describing where a set of images lives and whether the
//! images are raw binaries or pre-framed PAK files. The [`ImageSource`]
//! trait is the seam to the concrete loader; [`FsImageSource`] reads images
//! from a per-channel directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use log::{debug, error, info};
use thiserror::Error;

use crate::connection::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Bare program binaries; the server frames each segment itself.
    Raw,
    /// Pre-framed PAK files; the server only rewrites the trailing CRC.
    Pak,
}

/// A catalog entry for a set of images. The channel table is built once at
/// startup and is immutable for the life of the process.
#[derive(Debug)]
pub struct Channel {
    pub name: String,
    pub number: i16,
    pub kind: ChannelKind,
    /// Directory the channel's image files live in.
    pub location: PathBuf,
    /// File served when the client has not selected one explicitly.
    pub default_file: Option<String>,
    pub retronet_enabled: bool,
}

/// All channels the server knows about.
pub struct ChannelTable {
    channels: Vec<Arc<Channel>>,
}

impl ChannelTable {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self {
            channels: channels.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn lookup(&self, number: i16) -> Option<&Arc<Channel>> {
        self.channels.iter().find(|c| c.number == number)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// A loaded program image. Images are shared via `Arc`; the most recently
/// delivered one is cached on the connection so adjacent segment requests
/// skip the loader.
#[derive(Debug)]
pub struct Image {
    name: String,
    number: u32,
    data: Box<[u8]>,
    channel: Weak<Channel>,
}

impl Image {
    pub fn new(name: impl Into<String>, number: u32, data: Vec<u8>, channel: &Arc<Channel>) -> Self {
        Self {
            name: name.into(),
            number,
            data: data.into_boxed_slice(),
            channel: Arc::downgrade(channel),
        }
    }

    /// An image with no backing channel, e.g. the time packet.
    pub fn synthetic(name: impl Into<String>, number: u32, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            number,
            data: data.into_boxed_slice(),
            channel: Weak::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.upgrade()
    }

    /// PAK images are pre-framed and bypass normal packetization. Synthetic
    /// images have no channel and are never PAKs.
    pub fn is_pak(&self) -> bool {
        self.channel()
            .map_or(false, |chan| chan.kind == ChannelKind::Pak)
    }
}

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Image {0:06X} not found")]
    NotFound(u32),
}

/// Produces image bytes for a channel. Implementations may hit the
/// filesystem or the network; the returned image's data is stable until the
/// last reference is dropped.
pub trait ImageSource: Send + Sync {
    fn load(
        &self,
        conn: &Connection,
        chan: &Arc<Channel>,
        image: u32,
    ) -> Result<Arc<Image>, ImageError>;
}

/// Loads images from the channel's directory: `000001.nabu` for raw
/// channels, `000001.pak` for PAK channels (ids rendered as 6 hex digits).
pub struct FsImageSource;

impl FsImageSource {
    fn image_path(chan: &Channel, file: &str) -> PathBuf {
        chan.location.join(file)
    }

    fn read_image(
        chan: &Arc<Channel>,
        path: &Path,
        name: String,
        image: u32,
    ) -> Result<Arc<Image>, ImageError> {
        let data = fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ImageError::NotFound(image)
            } else {
                ImageError::IoError(e)
            }
        })?;
        debug!("Loaded '{}' ({} bytes).", path.display(), data.len());
        Ok(Arc::new(Image::new(name, image, data, chan)))
    }
}

impl ImageSource for FsImageSource {
    fn load(
        &self,
        conn: &Connection,
        chan: &Arc<Channel>,
        image: u32,
    ) -> Result<Arc<Image>, ImageError> {
        // On retronet-enabled channels, image 1 stands for "whatever file
        // the client selected".
        if chan.retronet_enabled && image == 1 {
            if let Some(selected) = conn.selected_file() {
                let path = Self::image_path(chan, &selected);
                return Self::read_image(chan, &path, selected, image);
            }
        }

        let file = match chan.kind {
            ChannelKind::Raw => format!("{:06X}.nabu", image),
            ChannelKind::Pak => format!("{:06X}.pak", image),
        };
        let path = Self::image_path(chan, &file);
        Self::read_image(chan, &path, file, image)
    }
}

/// Loads the requested image on behalf of `conn`, honoring the
/// connection's last-image cache and its currently selected channel.
pub fn image_load(
    source: &dyn ImageSource,
    conn: &Connection,
    image: u32,
) -> Option<Arc<Image>> {
    if let Some(img) = conn.last_image() {
        if img.number() == image {
            debug!(
                "[{}] Found image {:06X} in connection cache.",
                conn.name(),
                image
            );
            return Some(img);
        }
    }

    let Some(chan) = conn.channel() else {
        error!("[{}] No channel selected.", conn.name());
        return None;
    };

    match source.load(conn, &chan, image) {
        Ok(img) => Some(img),
        Err(e) => {
            error!(
                "[{}] Loading image {:06X} from channel {} failed: {}",
                conn.name(),
                image,
                chan.name,
                e
            );
            None
        }
    }
}

/// Returns the caller's image reference. Unless this was the image's final
/// segment, the image is parked in the connection's last-image cache so the
/// next request (most likely for the following segment) avoids a reload.
pub fn image_unload(conn: &Connection, img: Arc<Image>, last: bool) {
    if last {
        drop(conn.set_last_image_if(Some(&img), None));
    } else {
        drop(conn.set_last_image(Some(img)));
    }
}

/// Installs the channel with the given code as the connection's selection.
/// An unknown code is logged and leaves the current selection untouched.
pub fn channel_select(table: &ChannelTable, conn: &Connection, channel: i16) {
    match table.lookup(channel) {
        Some(chan) => {
            conn.set_channel(chan);
            info!(
                "[{}] Selected channel {:#06x} ({}).",
                conn.name(),
                channel,
                chan.name
            );
        }
        None => {
            error!("[{}] Channel {:#06x} not found.", conn.name(), channel);
        }
    }
}
