//! Asynchronous texture cache.
//!
//! Textures are requested by [`TextureKey`]. The first request queues a load
//! on a single background thread which decodes and rescales the image(s).
//! The GPU upload happens later, inside [`TextureCache::get`] on the render
//! thread: `get` is the only place a payload meets a [`TextureUploader`], so
//! GPU objects are never created on the loader thread.
//!
//! Entries move through `Unrequested -> Loading -> Ready | Failed`. Ready
//! textures are shared as `Arc`s and stay cached until [`TextureCache::reset`].
//! Failures are remembered and never retried.

mod loader;
mod source;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendError, Sender, TryRecvError};
use image::RgbaImage;
use thiserror::Error;

use crate::capabilities::Capabilities;
use crate::error::RenderResult;
use loader::{LoadJob, LoadResult, Worker};

pub use loader::{fit_to_limits, nearest_power_of_two, normal_map_from_bump, scale_image};
pub use source::{DirectoryImageSource, ImageSource, MemoryImageSource};

/// How long [`TextureCache::dispose`] waits for the loader thread.
pub const DISPOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifies a texture resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TextureKey {
    /// Color image.
    Image(String),
    /// Height map, uploaded as a normal map.
    BumpMap(String),
    /// Six images: +X, -X, +Y, -Y, +Z, -Z.
    CubeMap(Box<[String; 6]>),
}

impl TextureKey {
    #[must_use]
    pub fn cube(faces: &[String; 6]) -> Self {
        TextureKey::CubeMap(Box::new(faces.clone()))
    }

    /// Short description for logs and GPU labels.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            TextureKey::Image(name) => name.clone(),
            TextureKey::BumpMap(name) => format!("bump:{name}"),
            TextureKey::CubeMap(faces) => format!("cube:{}", faces.join(",")),
        }
    }
}

/// Errors while loading a texture.
#[derive(Error, Debug)]
pub enum TextureError {
    #[error("texture '{0}' not found")]
    NotFound(String),

    #[error("failed to decode '{name}': {message}")]
    Decode { name: String, message: String },

    #[error("image '{name}' is too small ({width}x{height})")]
    TooSmall { name: String, width: u32, height: u32 },

    #[error("texture upload failed: {0}")]
    Upload(String),

    #[error("texture load abandoned")]
    Abandoned,
}

/// Size constraints of the graphics context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureLimits {
    pub max_size: u32,
    pub non_power_of_two: bool,
}

impl TextureLimits {
    #[must_use]
    pub fn from_capabilities(capabilities: &Capabilities) -> Self {
        Self {
            max_size: capabilities.max_texture_size.max(64),
            non_power_of_two: capabilities.non_power_of_two,
        }
    }
}

/// Decoded pixels, ready for upload.
#[derive(Debug, Clone)]
pub enum TextureData {
    Flat(RgbaImage),
    /// Six square faces of equal size.
    Cube(Vec<RgbaImage>),
}

/// What the loader thread hands to the render thread.
#[derive(Debug, Clone)]
pub struct TexturePayload {
    pub data: TextureData,
    /// The source image had an alpha channel.
    pub has_alpha: bool,
}

impl TexturePayload {
    /// Size of one image (one face for cube maps).
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        match &self.data {
            TextureData::Flat(image) => image.dimensions(),
            TextureData::Cube(faces) => faces.first().map_or((0, 0), RgbaImage::dimensions),
        }
    }
}

/// Creates GPU textures. Implemented by render backends.
pub trait TextureUploader {
    type Texture;

    fn upload_texture(
        &mut self,
        key: &TextureKey,
        payload: &TexturePayload,
    ) -> RenderResult<Self::Texture>;
}

/// Called from the loader thread when a texture becomes available.
pub type TextureListener = Arc<dyn Fn(&TextureKey) + Send + Sync>;

/// Lifecycle state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureState {
    Unrequested,
    Loading,
    Ready,
    Failed,
}

enum Entry<T> {
    Loading(Receiver<LoadResult>),
    Ready { texture: Arc<T>, has_alpha: bool },
    Failed,
}

/// Memoizing texture cache with a background loader.
///
/// The entry map is owned by the render thread; the loader thread only sees
/// queued jobs and answers through per-entry channels.
pub struct TextureCache<T> {
    entries: HashMap<TextureKey, Entry<T>>,
    source: Arc<dyn ImageSource>,
    jobs: Option<Sender<LoadJob>>,
    worker: Option<Worker>,
    shutdown: Arc<AtomicBool>,
    listeners: Vec<TextureListener>,
    limits: TextureLimits,
    asynchronous: bool,
    dispatched: usize,
}

impl<T> TextureCache<T> {
    /// Creates a cache and starts its loader thread.
    ///
    /// If the thread cannot be spawned, loads run synchronously instead.
    pub fn new(source: Arc<dyn ImageSource>, limits: TextureLimits) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = crossbeam_channel::unbounded();
        let (jobs, worker) =
            match loader::spawn_worker(Arc::clone(&source), receiver, Arc::clone(&shutdown)) {
                Ok(worker) => (Some(sender), Some(worker)),
                Err(e) => {
                    log::error!("failed to start texture loader thread, loading inline: {e}");
                    (None, None)
                }
            };
        Self {
            entries: HashMap::new(),
            source,
            jobs,
            worker,
            shutdown,
            listeners: Vec::new(),
            limits,
            asynchronous: true,
            dispatched: 0,
        }
    }

    /// When false, [`TextureCache::get`] waits for pending loads.
    pub fn set_asynchronous(&mut self, asynchronous: bool) {
        self.asynchronous = asynchronous;
    }

    #[must_use]
    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    /// Registers a listener for newly available textures.
    pub fn add_listener(&mut self, listener: TextureListener) {
        self.listeners.push(listener);
    }

    #[must_use]
    pub fn limits(&self) -> TextureLimits {
        self.limits
    }

    /// Number of load jobs ever dispatched.
    #[must_use]
    pub fn loads_dispatched(&self) -> usize {
        self.dispatched
    }

    #[must_use]
    pub fn state(&self, key: &TextureKey) -> TextureState {
        match self.entries.get(key) {
            None => TextureState::Unrequested,
            Some(Entry::Loading(_)) => TextureState::Loading,
            Some(Entry::Ready { .. }) => TextureState::Ready,
            Some(Entry::Failed) => TextureState::Failed,
        }
    }

    /// True if the texture is ready and its source image had alpha.
    #[must_use]
    pub fn has_alpha(&self, key: &TextureKey) -> bool {
        matches!(
            self.entries.get(key),
            Some(Entry::Ready {
                has_alpha: true,
                ..
            })
        )
    }

    /// Starts loading `key` without waiting for it.
    pub fn request(&mut self, key: &TextureKey) {
        if self.entries.contains_key(key) {
            return;
        }
        let (reply, receiver) = crossbeam_channel::bounded(1);
        let job = LoadJob {
            key: key.clone(),
            limits: self.limits,
            reply,
            listeners: self.listeners.clone(),
        };
        let job = match &self.jobs {
            Some(jobs) => jobs.send(job).err().map(|SendError(job)| job),
            None => Some(job),
        };
        if let Some(job) = job {
            loader::run_job(self.source.as_ref(), job, &self.shutdown);
        }
        self.dispatched += 1;
        log::debug!("texture '{}' requested", key.label());
        self.entries.insert(key.clone(), Entry::Loading(receiver));
    }

    /// Returns the texture for `key`, or `None` while it is loading or after
    /// it failed.
    ///
    /// Must be called on the thread that owns the graphics context. A
    /// finished payload is uploaded through `uploader` on the first call
    /// after it arrives; later calls return the same `Arc`.
    pub fn get<U>(&mut self, key: &TextureKey, uploader: &mut U) -> Option<Arc<T>>
    where
        U: TextureUploader<Texture = T> + ?Sized,
    {
        self.request(key);
        let asynchronous = self.asynchronous;
        let entry = self.entries.get_mut(key)?;
        if let Entry::Loading(receiver) = entry {
            let result = if asynchronous {
                match receiver.try_recv() {
                    Ok(result) => result,
                    Err(TryRecvError::Empty) => return None,
                    Err(TryRecvError::Disconnected) => Err(TextureError::Abandoned),
                }
            } else {
                receiver.recv().unwrap_or(Err(TextureError::Abandoned))
            };
            *entry = Self::complete(key, result, uploader);
        }
        match entry {
            Entry::Ready { texture, .. } => Some(Arc::clone(texture)),
            _ => None,
        }
    }

    fn complete<U>(key: &TextureKey, result: LoadResult, uploader: &mut U) -> Entry<T>
    where
        U: TextureUploader<Texture = T> + ?Sized,
    {
        let uploaded = result.and_then(|payload| {
            uploader
                .upload_texture(key, &payload)
                .map(|texture| (texture, payload.has_alpha))
                .map_err(|e| TextureError::Upload(e.to_string()))
        });
        match uploaded {
            Ok((texture, has_alpha)) => Entry::Ready {
                texture: Arc::new(texture),
                has_alpha,
            },
            Err(e) => {
                log::warn!("texture '{}' unavailable: {e}", key.label());
                Entry::Failed
            }
        }
    }

    /// Forgets every entry after the graphics context was lost.
    ///
    /// Pending loads are abandoned; their results are discarded.
    pub fn reset(&mut self, limits: TextureLimits) {
        self.entries.clear();
        self.limits = limits;
    }

    /// Stops the loader thread, waiting at most [`DISPOSE_TIMEOUT`].
    ///
    /// Queued jobs are dropped; a job in progress may finish but its result
    /// is ignored and listeners are not called.
    pub fn dispose(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.jobs = None;
        self.entries.clear();
        if let Some(worker) = self.worker.take() {
            match worker.done.recv_timeout(DISPOSE_TIMEOUT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.handle.join().is_err() {
                        log::warn!("texture loader thread panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!("texture loader did not stop within {DISPOSE_TIMEOUT:?}");
                }
            }
        }
    }
}

impl<T> Drop for TextureCache<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}
