//! Auth code acquisition for legacy switches.
//!
//! A v1 switch only accepts commands signed with a credential it hands out
//! once its button is pressed during pairing. Current devices need no
//! pairing.

use std::{sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use log::info;
use tokio::{sync::mpsc, time};

use crate::{
   bluetooth::{
      link::Link,
      radio::Radio,
      scanner::{ScanEvent, ScanTiming, Scanner, Targets},
   },
   error::{Result, SwitchmateError},
   event::EventSender,
   switchmate::{
      parser,
      protocol::{CHAR_V1_AUTH, DeviceId, PKT_V1_AUTH_START, ProtocolVersion},
      recognition::Recognized,
   },
};

/// Bound on the whole pairing flow
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingResult {
   /// Base64 credential to store as the device's `auth_code`.
   AuthCode(String),
   /// The device speaks a protocol without pairing.
   NotRequired(Recognized),
}

/// Finds `id`, and if it is a legacy switch, obtains its auth code.
pub async fn pair(radio: Arc<dyn Radio>, id: DeviceId, event_tx: EventSender) -> Result<PairingResult> {
   time::timeout(PAIRING_TIMEOUT, run(radio, id, event_tx))
      .await
      .map_err(|_| SwitchmateError::PairingFailed("timed out"))?
}

async fn run(radio: Arc<dyn Radio>, id: DeviceId, event_tx: EventSender) -> Result<PairingResult> {
   let (tx, mut rx) = mpsc::channel(16);
   let scanner = Scanner::new(radio.clone(), ScanTiming::default(), tx).await?;
   scanner
      .start(None, Targets::Only(vec![id.clone()]))
      .await;

   let recognized = loop {
      match rx.recv().await {
         Some(ScanEvent::Discovered {
            id: found,
            recognized,
            ..
         }) if found == id => break recognized,
         Some(_) => {},
         None => return Err(SwitchmateError::ManagerShutdown),
      }
   };
   scanner.pause().await;
   info!(
      "Found {id}, a {} ({})",
      recognized.kind, recognized.version
   );
   if recognized.version != ProtocolVersion::V1 {
      return Ok(PairingResult::NotRequired(recognized));
   }

   let link = Link::new(radio.peripheral(&id)?, scanner, event_tx, &[CHAR_V1_AUTH]);
   link.connect().await?;
   let result = obtain_auth_code(&link).await;
   link.disconnect().await;
   result.map(PairingResult::AuthCode)
}

/// Starts pairing on a connected legacy switch and waits for the button.
pub async fn obtain_auth_code(link: &Link) -> Result<String> {
   let mut rx = link.notifications();
   link.write(CHAR_V1_AUTH, PKT_V1_AUTH_START).await?;
   info!("*** Press the button on the device now ***");

   let data = link.next_notification(&mut rx, CHAR_V1_AUTH).await?;
   let credential = parser::parse_auth_response(&data)?;
   Ok(BASE64.encode(credential))
}
