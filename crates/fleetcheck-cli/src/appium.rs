//! WebDriver client for the Appium automation server, speaking the W3C
//! wire protocol over `curl`. The checking flow lives in the app's Saved
//! Messages chat: the subject number is sent as a message, the sent message
//! is tapped, and the resulting popup names the verdict (a profile link for
//! registered numbers, a "not on Telegram" notice otherwise).

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{info, warn};

use fleetcheck_core::driver::{AutomationDriver, DriverError, DriverFactory, SubjectStatus};

const ONBOARDING_PROMPT: &str = "//android.widget.TextView[@text='Start Messaging']";
const NAV_MENU: &str = "//android.widget.ImageView[@content-desc='Open navigation menu']";
const SAVED_MESSAGES: &str = "(//android.widget.TextView[@text='Saved Messages'])[1]";
const MESSAGE_FIELD: &str =
    "//android.widget.EditText[contains(@text, 'Message') or string-length(@text) = 0]";
const SEND_BUTTON: &str = "//android.view.View[@content-desc='Send']";
const VIEW_PROFILE: &str = "//android.widget.TextView[contains(@text, 'View Profile')]";
const NOT_REGISTERED: &str =
    "//android.widget.TextView[contains(@text, 'This number is not on Telegram')]";
const DELETE_BUTTON: &str = "//android.widget.TextView[@text='Delete']";

const LOCATOR_POLL_INTERVAL: Duration = Duration::from_secs(2);
const LOCATOR_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AppiumDriverFactory {
    app_package: String,
}

impl AppiumDriverFactory {
    pub fn new(app_package: impl Into<String>) -> Self {
        AppiumDriverFactory {
            app_package: app_package.into(),
        }
    }
}

#[async_trait]
impl DriverFactory for AppiumDriverFactory {
    async fn create(
        &self,
        serial: &str,
        server_url: &str,
    ) -> Result<Box<dyn AutomationDriver>, DriverError> {
        let caps = json!({
            "capabilities": {
                "alwaysMatch": {
                    "platformName": "Android",
                    "appium:automationName": "UiAutomator2",
                    "appium:udid": serial,
                    "appium:appPackage": self.app_package,
                    "appium:noReset": true,
                    "appium:ignoreUnimportantViews": true,
                    "appium:disableWindowAnimation": true,
                    "appium:newCommandTimeout": 600,
                }
            }
        });
        let response = http("POST", &format!("{server_url}/session"), Some(&caps)).await?;
        let session_id = response["value"]["sessionId"]
            .as_str()
            .ok_or_else(|| DriverError::SessionLost(format!("no session id in {response}")))?
            .to_string();
        info!("automation session {session_id} created for {serial}");
        Ok(Box::new(AppiumDriver {
            session_url: format!("{server_url}/session/{session_id}"),
            app_package: self.app_package.clone(),
            in_saved_messages: Mutex::new(false),
        }))
    }
}

pub struct AppiumDriver {
    session_url: String,
    app_package: String,
    in_saved_messages: Mutex<bool>,
}

impl AppiumDriver {
    async fn find_element(&self, xpath: &str) -> Result<Option<String>, DriverError> {
        let body = json!({ "using": "xpath", "value": xpath });
        let response = http("POST", &format!("{}/element", self.session_url), Some(&body)).await?;
        if let Some(error) = response["value"]["error"].as_str() {
            return if error == "no such element" {
                Ok(None)
            } else {
                Err(DriverError::Command(format!(
                    "find {xpath} failed: {error}"
                )))
            };
        }
        let id = response["value"]
            .as_object()
            .and_then(|o| o.values().find_map(Value::as_str));
        Ok(id.map(str::to_string))
    }

    /// Polls the given locators until one matches, returning its index and
    /// element id. Mirrors the wait-for-any-of pattern the UI flow is built
    /// on: most screens are recognized by whichever marker shows up first.
    async fn wait_for_any(
        &self,
        locators: &[&str],
        timeout: Duration,
    ) -> Result<(usize, String), DriverError> {
        let started = Instant::now();
        loop {
            for (index, xpath) in locators.iter().enumerate() {
                if let Some(id) = self.find_element(xpath).await? {
                    return Ok((index, id));
                }
            }
            if started.elapsed() >= timeout {
                return Err(DriverError::Command(format!(
                    "none of {locators:?} appeared within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(LOCATOR_POLL_INTERVAL).await;
        }
    }

    async fn click(&self, element: &str) -> Result<(), DriverError> {
        let url = format!("{}/element/{element}/click", self.session_url);
        expect_ok(http("POST", &url, Some(&json!({}))).await?)
    }

    async fn send_keys(&self, element: &str, text: &str) -> Result<(), DriverError> {
        let url = format!("{}/element/{element}/value", self.session_url);
        expect_ok(http("POST", &url, Some(&json!({ "text": text }))).await?)
    }

    async fn current_activity(&self) -> Result<String, DriverError> {
        let url = format!("{}/appium/device/current_activity", self.session_url);
        let response = http("GET", &url, None).await?;
        Ok(response["value"].as_str().unwrap_or_default().to_string())
    }

    /// Navigates to the Saved Messages chat where checks are performed.
    /// Done once per session; the flow returns there after each popup.
    async fn ensure_saved_messages(&self) -> Result<(), DriverError> {
        {
            let entered = self.in_saved_messages.lock().unwrap_or_else(|e| e.into_inner());
            if *entered {
                return Ok(());
            }
        }
        self.bring_app_to_foreground().await?;
        let (_, menu) = self.wait_for_any(&[NAV_MENU], LOCATOR_TIMEOUT).await?;
        self.click(&menu).await?;
        let (_, saved) = self.wait_for_any(&[SAVED_MESSAGES], LOCATOR_TIMEOUT).await?;
        self.click(&saved).await?;
        let mut entered = self.in_saved_messages.lock().unwrap_or_else(|e| e.into_inner());
        *entered = true;
        Ok(())
    }
}

#[async_trait]
impl AutomationDriver for AppiumDriver {
    async fn is_app_active(&self) -> Result<bool, DriverError> {
        let activity = self.current_activity().await?;
        Ok(activity.contains(&self.app_package))
    }

    async fn bring_app_to_foreground(&self) -> Result<(), DriverError> {
        let url = format!("{}/appium/device/activate_app", self.session_url);
        expect_ok(http("POST", &url, Some(&json!({ "appId": self.app_package }))).await?)
    }

    async fn detect_onboarding_prompt(&self, timeout: Duration) -> Result<bool, DriverError> {
        self.bring_app_to_foreground().await?;
        match self.wait_for_any(&[ONBOARDING_PROMPT, NAV_MENU], timeout).await {
            Ok((0, _)) => Ok(true),
            Ok(_) => Ok(false),
            Err(DriverError::Command(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn dismiss_onboarding_prompt(&self) -> Result<(), DriverError> {
        if let Some(prompt) = self.find_element(ONBOARDING_PROMPT).await? {
            self.click(&prompt).await?;
        }
        Ok(())
    }

    async fn is_signed_in(&self) -> Result<bool, DriverError> {
        self.bring_app_to_foreground().await?;
        // Whichever shows first decides: the navigation menu only exists
        // behind a signed-in account, the start prompt only in front of one.
        match self
            .wait_for_any(&[NAV_MENU, ONBOARDING_PROMPT], Duration::from_secs(10))
            .await
        {
            Ok((0, _)) => Ok(true),
            Ok(_) => Ok(false),
            Err(DriverError::Command(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn check_subject(&self, subject: &str) -> Result<SubjectStatus, DriverError> {
        self.ensure_saved_messages().await?;

        let (_, field) = self.wait_for_any(&[MESSAGE_FIELD], LOCATOR_TIMEOUT).await?;
        self.click(&field).await?;
        self.send_keys(&field, subject).await?;
        let (_, send) = self.wait_for_any(&[SEND_BUTTON], LOCATOR_TIMEOUT).await?;
        self.click(&send).await?;

        // The freshly sent message carries the number; tapping it opens the
        // action popup that names the verdict.
        let sent_locator = format!(
            "//android.view.View[contains(@content-desc, '{subject}')][last()]"
        );
        let (_, message) = self
            .wait_for_any(&[sent_locator.as_str()], LOCATOR_TIMEOUT)
            .await?;
        self.click(&message).await?;

        let verdict = self
            .wait_for_any(
                &[VIEW_PROFILE, NOT_REGISTERED, DELETE_BUTTON],
                LOCATOR_TIMEOUT,
            )
            .await;
        // Close the popup regardless of the outcome so the chat is usable
        // for the next subject.
        let _ = self.press_back().await;

        match verdict {
            Ok((0, _)) => Ok(SubjectStatus::Registered),
            Ok((1, _)) => Ok(SubjectStatus::NotRegistered),
            Ok(_) => Ok(SubjectStatus::Indeterminate),
            Err(DriverError::Command(detail)) => {
                warn!("no verdict popup for {subject}: {detail}");
                Ok(SubjectStatus::Indeterminate)
            }
            Err(e) => Err(e),
        }
    }

    async fn press_back(&self) -> Result<(), DriverError> {
        let url = format!("{}/back", self.session_url);
        expect_ok(http("POST", &url, Some(&json!({}))).await?)
    }

    async fn quit(&self) -> Result<(), DriverError> {
        http("DELETE", &self.session_url, None).await.map(|_| ())
    }
}

fn expect_ok(response: Value) -> Result<(), DriverError> {
    match response["value"]["error"].as_str() {
        Some(error) => Err(DriverError::Command(error.to_string())),
        None => Ok(()),
    }
}

/// One WebDriver request via curl. A transport-level failure (the server is
/// gone) is a lost session; an HTTP-level error still yields a JSON body
/// and is judged by the caller.
async fn http(method: &str, url: &str, body: Option<&Value>) -> Result<Value, DriverError> {
    let mut cmd = Command::new("curl");
    cmd.args(["-sS", "--max-time", "60", "-X", method]);
    cmd.args(["-H", "Content-Type: application/json"]);
    if let Some(body) = body {
        cmd.args(["-d", &body.to_string()]);
    }
    cmd.arg(url);

    let output = cmd
        .output()
        .await
        .map_err(|e| DriverError::SessionLost(format!("failed to run curl: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DriverError::SessionLost(format!(
            "{method} {url} failed: {}",
            stderr.trim()
        )));
    }
    serde_json::from_slice(&output.stdout).map_err(|e| {
        DriverError::Command(format!("{method} {url} returned invalid JSON: {e}"))
    })
}
