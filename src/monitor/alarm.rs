//! The alarm monitor: pipeline hosting plus message delivery.
//!
//! Extends the pipeline monitor for the `alarm` flavor with the three
//! delivery channels (SMS over an HTTP form gateway, email over SMTP,
//! phone calls over a Twilio-style API), contact-list resolution and the
//! shifter-roster watcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Protocol;
use crate::node::{AlarmMessage, AlarmSink, DeliveryError};
use crate::store::ConfigStore;
use crate::util::{level_index, make_hash, unix_now, ALARM_HASH_LEN};

use super::{Monitor, MonitorApp};
use crate::monitor::pipeline::PipelineMonitor;

/// How often the shifter roster is compared against the last known one.
const SHIFTER_CHECK_PERIOD: f64 = 60.0;

/// Cut a message at a word boundary so providers don't bill for overlength
/// messages. Returns the (possibly shortened) text and whether it was cut.
fn shorten_to_words(message: &str, max_len: usize) -> (String, bool) {
    if message.chars().count() <= max_len {
        return (message.to_string(), false);
    }
    let prefix: String = message.chars().take(max_len + 1).collect();
    let cut = match prefix.rfind(' ') {
        Some(i) => prefix[..i].trim_end().to_string(),
        None => prefix.chars().take(max_len).collect(),
    };
    (cut, true)
}

/// Sends alarms through whatever channels the alarm config names.
pub struct AlarmDeliverer {
    store: Arc<dyn ConfigStore>,
    experiment: String,
    http: Client,
}

impl AlarmDeliverer {
    pub fn new(store: Arc<dyn ConfigStore>, experiment: &str) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            store,
            experiment: experiment.to_string(),
            http,
        }
    }

    async fn send_sms(&self, numbers: &[String], message: &str) -> Result<(), DeliveryError> {
        let config = self
            .store
            .alarm_config()
            .await
            .map_err(|e| DeliveryError::Provider(e.to_string()))?
            .connection_details
            .websms
            .ok_or_else(|| DeliveryError::Provider("no SMS connection details".to_string()))?;
        if numbers.is_empty() {
            return Err(DeliveryError::Provider("no phone number given".to_string()));
        }
        let (message, shortened) = shorten_to_words(message, config.maxmessagelength);
        if shortened {
            info!(
                "Message exceeds {} characters and will be shortened",
                config.maxmessagelength
            );
        }
        let now = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        warn!(
            "Sending SMS to {} recipient{}",
            numbers.len(),
            if numbers.len() > 1 { "s" } else { "" }
        );
        for number in numbers {
            let mut form: Vec<(String, String)> = config
                .postparameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            form.push(("Recipient".to_string(), number.clone()));
            form.push(("SMSText".to_string(), message.clone()));
            form.push(("SendDate".to_string(), now.clone()));
            let response = self
                .http
                .post(&config.url)
                .form(&form)
                .send()
                .await
                .map_err(|e| DeliveryError::Provider(e.to_string()))?;
            if response.status().as_u16() != 200 {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(DeliveryError::Provider(format!(
                    "couldn't send message, status {}: {}",
                    status, body
                )));
            }
        }
        Ok(())
    }

    async fn send_phonecall(&self, numbers: &[String], message: &str) -> Result<(), DeliveryError> {
        let config = self
            .store
            .alarm_config()
            .await
            .map_err(|e| DeliveryError::Provider(e.to_string()))?
            .connection_details
            .twilio
            .ok_or_else(|| DeliveryError::Provider("no phone connection details".to_string()))?;
        if numbers.is_empty() {
            return Err(DeliveryError::Provider("no phone number given".to_string()));
        }
        let (message, shortened) = shorten_to_words(message, config.maxmessagelength);
        let message = if shortened {
            info!(
                "Message exceeds {} characters and will be shortened",
                config.maxmessagelength
            );
            format!("<p>{}</p><p>Message shortened.</p>", message)
        } else {
            message
        };
        let message = format!("This is the {} alarm system. {}", self.experiment, message);
        warn!(
            "Making phone call to {} recipient{}",
            numbers.len(),
            if numbers.len() > 1 { "s" } else { "" }
        );
        for number in numbers {
            let parameters = serde_json::json!({ "message": message }).to_string();
            let form = [
                ("To", number.as_str()),
                ("From", config.fromnumber.as_str()),
                ("Parameters", parameters.as_str()),
            ];
            let response = self
                .http
                .post(&config.url)
                .basic_auth(&config.auth.0, Some(&config.auth.1))
                .form(&form)
                .send()
                .await
                .map_err(|e| DeliveryError::Provider(e.to_string()))?;
            if response.status().as_u16() != 201 {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(DeliveryError::Provider(format!(
                    "couldn't place call, status {}: {}",
                    status, body
                )));
            }
        }
        Ok(())
    }

    async fn send_email(
        &self,
        addresses: &[String],
        subject: &str,
        message: &str,
        level: i64,
        pipeline: &str,
    ) -> Result<(), DeliveryError> {
        let alarm_config = self
            .store
            .alarm_config()
            .await
            .map_err(|e| DeliveryError::Provider(e.to_string()))?;
        let config = alarm_config
            .connection_details
            .email
            .clone()
            .ok_or_else(|| DeliveryError::Provider("no email connection details".to_string()))?;
        if addresses.is_empty() {
            return Err(DeliveryError::Provider("no email address given".to_string()));
        }
        let mut body = format!("<b>{}</b>", message);
        if let Some(website) = &config.website {
            body.push_str("<br><br>Show sensors involved in this pipeline:<ul>");
            if let Ok(doc) = self.store.get_pipeline(pipeline).await {
                for sensor in &doc.depends_on {
                    body.push_str(&format!(
                        "<li><a href=\"{}?sensor={}\">{}</a></li>",
                        website, sensor, sensor
                    ));
                }
            }
            body.push_str("</ul>");
        }
        let silence_duration = alarm_config
            .silence_duration
            .get(level_index(level, alarm_config.silence_duration.len()))
            .copied()
            .unwrap_or(0.0);
        let silence_minutes = (silence_duration / 60.0) as i64;
        body.push_str(&format!(
            "This alarm is automatically silenced for <b>{} minutes</b>.",
            silence_minutes
        ));
        if let Some(website) = &config.website {
            body.push_str(
                "<br><br>To silence the pipeline for longer, click one of the following links:<ul>",
            );
            for (minutes, text) in [(15, "15 minutes"), (60, "1 hour"), (360, "6 hours")] {
                if minutes > silence_minutes {
                    body.push_str(&format!(
                        "<li><a href=\"{}/pipeline?pipeline={}&silence={}\">{}</a></li> ",
                        website, pipeline, minutes, text
                    ));
                }
            }
            body.push_str("</ul>");
        }
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M").to_string();
        body.push_str(&format!(
            "<hr>Message created on {} by {} slow control.",
            now, self.experiment
        ));

        let mut builder = Message::builder()
            .from(
                config
                    .fromaddr
                    .parse()
                    .map_err(|e| DeliveryError::Provider(format!("bad from address: {}", e)))?,
            )
            .subject(subject)
            .header(ContentType::TEXT_HTML);
        for address in addresses {
            builder = builder.to(address
                .parse()
                .map_err(|e| DeliveryError::Provider(format!("bad address {}: {}", address, e)))?);
        }
        let email = builder
            .body(body)
            .map_err(|e| DeliveryError::Provider(e.to_string()))?;

        warn!(
            "Sending e-mail to {} recipient{}",
            addresses.len(),
            if addresses.len() > 1 { "s" } else { "" }
        );
        let transport = if config.server == "localhost" {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous("localhost").build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)
                .map_err(|e| DeliveryError::Provider(e.to_string()))?
                .port(config.port)
                .credentials(Credentials::new(
                    config.fromaddr.clone(),
                    config.password.clone(),
                ))
                .build()
        };
        transport
            .send(email)
            .await
            .map_err(|e| DeliveryError::Provider(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl AlarmSink for AlarmDeliverer {
    /// Push one alarm through every configured channel. All channels are
    /// attempted even when one fails; the last failure is reported so the
    /// caller applies the can't-send silence.
    async fn log_alarm(&self, alarm: AlarmMessage) -> Result<(), DeliveryError> {
        let routing = match alarm.routing.clone() {
            Some(routing) => routing,
            None => self
                .store
                .get_contact_addresses(alarm.level)
                .await
                .map_err(|e| DeliveryError::Provider(e.to_string()))?,
        };
        if routing.is_empty() {
            return Err(DeliveryError::NoChannels);
        }
        let mut last_error = None;
        for (protocol, recipients) in &routing {
            let result = match protocol {
                Protocol::Sms => {
                    let text = format!("{} {}", self.experiment.to_uppercase(), alarm.message);
                    self.send_sms(recipients, &text).await
                }
                Protocol::Email => {
                    let mut experiment = self.experiment.clone();
                    if let Some(first) = experiment.get_mut(..1) {
                        first.make_ascii_uppercase();
                    }
                    let subject = format!("{} level {} alarm", experiment, alarm.level);
                    self.send_email(
                        recipients,
                        &subject,
                        &alarm.message,
                        alarm.level,
                        &alarm.pipeline,
                    )
                    .await
                }
                Protocol::Phone => self.send_phonecall(recipients, &alarm.message).await,
            };
            if let Err(e) = result {
                error!("{} delivery failed: {}", protocol, e);
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// The `pl_alarm` process: a pipeline monitor that can actually deliver.
pub struct AlarmMonitor {
    inner: PipelineMonitor,
    alarms: Arc<dyn AlarmSink>,
    store: Arc<dyn ConfigStore>,
    current_shifters: Mutex<Vec<String>>,
}

impl AlarmMonitor {
    pub async fn new(experiment: &str, store: Arc<dyn ConfigStore>) -> anyhow::Result<Arc<Self>> {
        let deliverer = Arc::new(AlarmDeliverer::new(store.clone(), experiment));
        Self::with_sink(experiment, store, deliverer).await
    }

    /// Used by the tests to swap the delivery seam.
    pub async fn with_sink(
        experiment: &str,
        store: Arc<dyn ConfigStore>,
        alarms: Arc<dyn AlarmSink>,
    ) -> anyhow::Result<Arc<Self>> {
        let inner =
            PipelineMonitor::new("alarm", experiment, store.clone(), alarms.clone()).await?;
        let current_shifters = store.shifters().await.unwrap_or_default();
        Ok(Arc::new(Self {
            inner,
            alarms,
            store,
            current_shifters: Mutex::new(current_shifters),
        }))
    }

    /// Raise an informational alarm whenever the on-shift roster changes.
    /// An empty roster pages the outgoing shifters, who are temporarily
    /// put back on shift so the message reaches someone.
    pub async fn check_shifters(&self) -> anyhow::Result<()> {
        let new_shifters = self.store.shifters().await?;
        let mut current = self.current_shifters.lock().await;
        if new_shifters == *current {
            return Ok(());
        }
        let hash = Some(make_hash(
            [format!("{}", unix_now()), "AlarmMonitor".to_string()],
            ALARM_HASH_LEN,
        ));
        if new_shifters.is_empty() {
            let previous = current.clone();
            for name in &previous {
                let _ = self.store.set_contact_on_shift(name, true).await;
            }
            let result = self
                .alarms
                .log_alarm(AlarmMessage {
                    level: 1,
                    message: "No more allocated shifters.".to_string(),
                    pipeline: "AlarmMonitor".to_string(),
                    hash,
                    routing: None,
                })
                .await;
            if let Err(e) = result {
                error!("Could not announce the empty shift roster: {}", e);
            }
            for name in &previous {
                let _ = self.store.set_contact_on_shift(name, false).await;
            }
            return Ok(());
        }
        let message = format!(
            "{} {} now on shift.",
            new_shifters.join(", "),
            if new_shifters.len() == 1 { "is" } else { "are" }
        );
        *current = new_shifters;
        drop(current);
        if let Err(e) = self
            .alarms
            .log_alarm(AlarmMessage {
                level: 1,
                message,
                pipeline: "AlarmMonitor".to_string(),
                hash,
                routing: None,
            })
            .await
        {
            error!("Could not announce the shift change: {}", e);
        }
        Ok(())
    }
}

#[async_trait]
impl MonitorApp for AlarmMonitor {
    fn name(&self) -> &str {
        "pl_alarm"
    }

    async fn setup(self: Arc<Self>, monitor: &Arc<Monitor>) -> anyhow::Result<()> {
        self.inner.start_configured().await?;
        let watcher = self.clone();
        monitor
            .register_periodic("shiftercheck", SHIFTER_CHECK_PERIOD, true, move || {
                let watcher = watcher.clone();
                async move {
                    watcher.check_shifters().await?;
                    Ok(None)
                }
            })
            .await;
        Ok(())
    }

    async fn process_command(self: Arc<Self>, _monitor: &Arc<Monitor>, command: &str) {
        self.inner.handle_command(command).await;
    }

    async fn shutdown(self: Arc<Self>, _monitor: &Arc<Monitor>) {
        info!("pl_alarm shutting down");
        self.inner.stop_all(true).await;
    }
}
