//! Live partner-console session backed by a visible Chrome window.

use super::{CapabilityDriver, DriverError};
use crate::config::SessionConfig;
use crate::http::{build_download_client, normalize_image_url};
use crate::models::{ContextId, ItemId};
use crate::session::{CredentialFile, StoredCookie, cookie_header_for};
use headless_chrome::protocol::cdp::{DOM, Network::CookieParam};
use headless_chrome::{Browser, Element, LaunchOptions, Tab};
use reqwest::header::COOKIE;
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const PREVIEW_IMAGE: &str = "img.styles-picture___6gWHl";
const GALLERY: &str = "div.___wrapper___7pLKs.style-picturesDrawer___55UwA";
const LOADED_IMAGE: &str = "img[data-testid='loaded-image']";
const LARGE_IMAGE: &str = "img.style-root___17qgj.style-main___6BATS";
const UPLOAD_TRIGGER: &str = "span.___content___2ml2l";
const FILE_INPUT: &str = "input[type='file']";
const CLOSE_GALLERY_XPATH: &str = "//span[@aria-label='Закрыть']";
const SAVE_BUTTON: &str = "button[data-e2e='next-step-button']";
const CHALLENGE_MARKER: &str = "captcha";

/// The first file input belongs to an unrelated upload slot.
const REPLACEMENT_INPUT_INDEX: usize = 1;

pub struct LiveDriver {
    browser: Browser,
    tab: Arc<Tab>,
    config: SessionConfig,
    http: reqwest::blocking::Client,
}

impl LiveDriver {
    /// Starts Chrome and applies stored credentials. A missing or unreadable
    /// credential file only means the operator has to sign in by hand.
    pub fn launch(config: SessionConfig, credentials: &CredentialFile) -> Result<Self, DriverError> {
        let mut builder = LaunchOptions::default_builder();
        builder
            .headless(config.headless)
            .window_size(Some((1600, 1000)))
            .idle_browser_timeout(Duration::from_secs(24 * 60 * 60))
            .args(vec![
                OsStr::new("--start-maximized"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
            ])
            .path(config.chrome_path.clone());
        let options = builder
            .build()
            .map_err(|err| DriverError::SessionLost(format!("launch options: {err}")))?;
        let browser = Browser::new(options)
            .map_err(|err| DriverError::SessionLost(format!("launch browser: {err}")))?;
        let tab = browser
            .new_tab()
            .map_err(|err| DriverError::SessionLost(format!("open tab: {err}")))?;
        info!(target = "reupload.driver", headless = config.headless, "browser started");

        let http = build_download_client(&config);
        let mut driver = Self {
            browser,
            tab,
            config,
            http,
        };
        driver.apply_credentials(credentials);
        Ok(driver)
    }

    fn apply_credentials(&mut self, credentials: &CredentialFile) {
        let cookies = match credentials.load() {
            Ok(cookies) => cookies,
            Err(err) => {
                warn!(target = "reupload.driver", error = %err, "credentials not loaded; sign in manually");
                return;
            }
        };
        if let Err(err) = self.open_home() {
            warn!(target = "reupload.driver", error = %err, "could not open home before applying credentials");
            return;
        }
        let params: Vec<CookieParam> = cookies.iter().filter_map(cookie_param).collect();
        let count = params.len();
        match self.tab.set_cookies(params) {
            Ok(()) => {
                if let Err(err) = self.tab.reload(false, None) {
                    warn!(target = "reupload.driver", error = %err, "reload after applying credentials failed");
                }
                info!(target = "reupload.driver", count, path = %credentials.path().display(), "credentials applied");
            }
            Err(err) => warn!(target = "reupload.driver", error = %err, "credentials rejected by browser"),
        }
    }

    fn session_alive(&self) -> bool {
        self.browser.get_version().is_ok()
    }

    /// Classifies a browser error: a dead browser is fatal, anything else is
    /// an ordinary step failure.
    fn classify(&self, context: &str, err: impl std::fmt::Display) -> DriverError {
        if self.session_alive() {
            DriverError::step(format!("{context}: {err}"))
        } else {
            DriverError::SessionLost(format!("{context}: {err}"))
        }
    }

    fn item_url(&self, context: &ContextId, item: &ItemId) -> String {
        item_url(&self.config.base_url, context, item)
    }

    fn session_cookies(&self) -> Result<Vec<StoredCookie>, DriverError> {
        let cookies = self
            .tab
            .get_cookies()
            .map_err(|err| self.classify("read cookies", err))?;
        Ok(cookies
            .into_iter()
            .filter_map(|cookie| {
                serde_json::to_value(cookie)
                    .ok()
                    .and_then(|value| serde_json::from_value::<StoredCookie>(value).ok())
            })
            .collect())
    }

    fn js_click(element: &Element<'_>) -> bool {
        element
            .call_js_fn("function() { this.click(); }", vec![], false)
            .is_ok()
    }

    fn settle(&self) {
        std::thread::sleep(self.config.settle_delay);
    }
}

pub fn item_url(base_url: &str, context: &ContextId, item: &ItemId) -> String {
    format!(
        "{}/supplier/{}/assortment/offer-card?article={}&source=businessStocks",
        base_url.trim_end_matches('/'),
        urlencoding::encode(context.as_str()),
        urlencoding::encode(item.as_str()),
    )
}

impl CapabilityDriver for LiveDriver {
    fn detect_interrupt(&mut self) -> Result<bool, DriverError> {
        match self.tab.get_content() {
            Ok(html) => Ok(html.to_lowercase().contains(CHALLENGE_MARKER)),
            Err(err) => {
                debug!(target = "reupload.driver", error = %err, "page source unavailable");
                Ok(false)
            }
        }
    }

    fn navigate_to_item(&mut self, context: &ContextId, item: &ItemId) -> Result<(), DriverError> {
        let url = self.item_url(context, item);
        debug!(target = "reupload.driver", url = %url, "navigate");
        self.tab
            .navigate_to(&url)
            .and_then(|tab| tab.wait_until_navigated())
            .map(|_| ())
            .map_err(|err| self.classify("navigate", err))
    }

    fn wait_for_preview_images(&mut self, timeout: Duration) -> Result<bool, DriverError> {
        Ok(self
            .tab
            .wait_for_element_with_custom_timeout(PREVIEW_IMAGE, timeout)
            .is_ok())
    }

    fn open_image_gallery(&mut self) -> Result<bool, DriverError> {
        let timeout = self.config.step_timeout;
        match self
            .tab
            .wait_for_element_with_custom_timeout(PREVIEW_IMAGE, timeout)
        {
            Ok(preview) => {
                let clicked = preview
                    .scroll_into_view()
                    .and_then(|el| el.move_mouse_over())
                    .and_then(|el| el.click());
                if let Err(err) = clicked {
                    warn!(target = "reupload.driver", error = %err, "preview click failed");
                }
            }
            Err(err) => {
                warn!(target = "reupload.driver", error = %err, "preview not found for click");
            }
        }
        Ok(self
            .tab
            .wait_for_element_with_custom_timeout(GALLERY, timeout)
            .is_ok())
    }

    fn latest_image_source(&mut self) -> Result<Option<String>, DriverError> {
        if self
            .tab
            .wait_for_element_with_custom_timeout(LOADED_IMAGE, self.config.step_timeout)
            .is_err()
        {
            return Ok(None);
        }
        let selector = format!("{GALLERY} {LARGE_IMAGE}");
        let images = match self.tab.find_elements(&selector) {
            Ok(images) => images,
            Err(_) => return Ok(None),
        };
        let Some(last) = images.last() else {
            return Ok(None);
        };
        let src = last
            .get_attribute_value("src")
            .map_err(|err| self.classify("read image src", err))?;
        Ok(src.filter(|value| !value.trim().is_empty()))
    }

    fn download_image(&mut self, url: &str) -> Result<PathBuf, DriverError> {
        let url = normalize_image_url(url);
        let parsed = reqwest::Url::parse(&url)
            .map_err(|err| DriverError::step(format!("invalid image url {url}: {err}")))?;
        let host = parsed.host_str().unwrap_or_default().to_string();
        let cookies = self.session_cookies()?;

        let mut request = self.http.get(parsed);
        if let Some(header) = cookie_header_for(&host, &cookies) {
            request = request.header(COOKIE, header);
        }
        let response = request
            .send()
            .map_err(|err| DriverError::step(format!("download {url}: {err}")))?;
        if !response.status().is_success() {
            return Err(DriverError::step(format!(
                "download {url}: HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .map_err(|err| DriverError::step(format!("download body {url}: {err}")))?;

        let dir = std::env::temp_dir().join(format!("ym_images_{}", Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir)
            .map_err(|err| DriverError::step(format!("create {}: {err}", dir.display())))?;
        let path = dir.join("orig.webp");
        std::fs::write(&path, &bytes)
            .map_err(|err| DriverError::step(format!("write {}: {err}", path.display())))?;
        Ok(path)
    }

    fn submit_replacement_file(&mut self, path: &Path) -> Result<bool, DriverError> {
        let triggers = self
            .tab
            .find_elements(UPLOAD_TRIGGER)
            .map_err(|err| self.classify("find upload trigger", err))?;
        let Some(trigger) = triggers.first() else {
            return Ok(false);
        };
        trigger
            .scroll_into_view()
            .map_err(|err| self.classify("scroll upload trigger", err))?;

        if self
            .tab
            .wait_for_element_with_custom_timeout(FILE_INPUT, self.config.step_timeout)
            .is_err()
        {
            return Ok(false);
        }
        let inputs = self
            .tab
            .find_elements(FILE_INPUT)
            .map_err(|err| self.classify("find file inputs", err))?;
        let Some(input) = inputs.get(REPLACEMENT_INPUT_INDEX) else {
            warn!(target = "reupload.driver", found = inputs.len(), "not enough file inputs");
            return Ok(false);
        };
        self.tab
            .call_method(DOM::SetFileInputFiles {
                files: vec![path.to_string_lossy().into_owned()],
                node_id: None,
                backend_node_id: Some(input.backend_node_id),
                object_id: None,
            })
            .map_err(|err| self.classify("set input files", err))?;
        self.settle();
        Ok(true)
    }

    fn confirm_and_save(&mut self) -> Result<bool, DriverError> {
        match self.tab.find_element_by_xpath(CLOSE_GALLERY_XPATH) {
            Ok(close) => {
                if !Self::js_click(&close) {
                    debug!(target = "reupload.driver", "gallery close click ignored");
                }
            }
            Err(_) => debug!(target = "reupload.driver", "gallery close control absent"),
        }

        let save = match self
            .tab
            .wait_for_element_with_custom_timeout(SAVE_BUTTON, self.config.step_timeout)
        {
            Ok(save) => save,
            Err(_) => return Ok(false),
        };
        save.scroll_into_view()
            .and_then(|el| el.click())
            .map_err(|err| self.classify("click save", err))?;
        self.settle();
        Ok(true)
    }

    fn open_home(&mut self) -> Result<(), DriverError> {
        let home = format!("{}/", self.config.base_url.trim_end_matches('/'));
        self.tab
            .navigate_to(&home)
            .and_then(|tab| tab.wait_until_navigated())
            .map(|_| ())
            .map_err(|err| self.classify("open home", err))
    }

    fn export_credentials(&mut self) -> Result<Option<Vec<StoredCookie>>, DriverError> {
        self.session_cookies().map(Some)
    }
}

/// Stored cookie as a browser cookie parameter. `expires` is kept so
/// persistent cookies survive a browser restart.
fn cookie_param(cookie: &StoredCookie) -> Option<CookieParam> {
    serde_json::from_value(serde_json::json!({
        "name": cookie.name,
        "value": cookie.value,
        "domain": cookie.domain,
        "path": cookie.path,
        "secure": cookie.secure,
        "httpOnly": cookie.http_only,
        "expires": cookie.expires,
    }))
    .ok()
}
