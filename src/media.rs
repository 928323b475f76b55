//! Process-scoped GStreamer framework handle. Replaces the original's
//! module-level init refcount with an explicit, acquirable resource: the
//! first `acquire()` in a process calls `gstreamer::init()`, later calls
//! just clone the handle. There is no matching `deinit()` — GStreamer does
//! not support being safely re-initialized after teardown, so the handle is
//! kept alive for the life of the process instead of being refcounted down
//! to zero.

use once_cell::sync::OnceCell;

use crate::error::{Result, StreamError};

static INIT: OnceCell<()> = OnceCell::new();

#[derive(Debug, Clone, Copy)]
pub struct MediaFramework {
    _private: (),
}

impl MediaFramework {
    pub fn acquire() -> Result<MediaFramework> {
        INIT.get_or_try_init(|| {
            gstreamer::init()
                .map_err(|e| StreamError::ResourceUnsupported(format!("gstreamer init failed: {e}")))
        })?;
        Ok(MediaFramework { _private: () })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_idempotent() {
        let a = MediaFramework::acquire().unwrap();
        let b = MediaFramework::acquire().unwrap();
        let _ = (a, b);
    }
}
