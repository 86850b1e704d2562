// Frame capture through RenderDoc
//
// Only active when built with the `renderdoc` feature and launched from
// RenderDoc (the in-app API is provided by the injected library).

#[cfg(feature = "renderdoc")]
type Api = renderdoc::RenderDoc<renderdoc::V141>;

pub struct FrameCapture {
    #[cfg(feature = "renderdoc")]
    api: Option<Api>,
}

impl FrameCapture {
    pub fn new(enabled: bool) -> Self {
        #[cfg(feature = "renderdoc")]
        {
            let api = if enabled {
                match Api::new() {
                    Ok(api) => {
                        log::info!("RenderDoc in-app API loaded");
                        Some(api)
                    }
                    Err(e) => {
                        log::warn!("RenderDoc not available: {}", e);
                        None
                    }
                }
            } else {
                None
            };
            Self { api }
        }

        #[cfg(not(feature = "renderdoc"))]
        {
            if enabled {
                log::warn!("RenderDoc capture requested but the `renderdoc` feature is disabled");
            }
            Self {}
        }
    }

    pub fn is_available(&self) -> bool {
        #[cfg(feature = "renderdoc")]
        {
            self.api.is_some()
        }
        #[cfg(not(feature = "renderdoc"))]
        {
            false
        }
    }

    /// Capture the next presented frame. Returns false when no capture tool is attached.
    pub fn trigger(&mut self) -> bool {
        #[cfg(feature = "renderdoc")]
        {
            if let Some(api) = self.api.as_mut() {
                api.trigger_capture();
                log::info!("RenderDoc capture triggered");
                return true;
            }
        }
        log::debug!("Capture key pressed but no capture tool attached");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_capture_is_a_no_op() {
        let mut capture = FrameCapture::new(false);
        assert!(!capture.is_available());
        assert!(!capture.trigger());
    }
}
