//! Office geofencing and the location-confirmation lifecycle.
//!
//! After a successful recognition the user has 60 seconds to DM a Google
//! Maps link. The reply is parsed into coordinates, validated against the
//! enabled offices by great-circle distance, and the nearest office decides
//! acceptance. Reply and timer race; whichever fires first removes the
//! pending state, and the loser finds nothing to do.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("offices file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("offices file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no enabled offices configured")]
    NoEnabledOffices,
    #[error("no coordinates found in url")]
    NoCoordinates,
    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Office {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: f64,
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OfficeList {
    offices: Vec<Office>,
}

#[derive(Debug, Clone)]
pub struct OfficeMatch {
    pub office: Office,
    pub distance: f64,
    pub within_radius: bool,
}

/// The enabled offices, loaded once at startup.
#[derive(Debug, Clone)]
pub struct OfficeDirectory {
    offices: Vec<Office>,
}

impl OfficeDirectory {
    /// Load the offices file, writing the default list first if the file
    /// does not exist. A config with no enabled office is rejected.
    pub fn load(path: &str) -> Result<Self, LocationError> {
        if !Path::new(path).exists() {
            warn!(path, "offices file missing, creating default");
            if let Some(dir) = Path::new(path).parent() {
                std::fs::create_dir_all(dir)?;
            }
            let data = serde_json::to_string_pretty(&OfficeList {
                offices: default_offices(),
            })?;
            std::fs::write(path, data)?;
        }

        let data = std::fs::read_to_string(path)?;
        let list: OfficeList = serde_json::from_str(&data)?;
        let offices: Vec<Office> = list
            .offices
            .into_iter()
            .filter(|office| office.enabled)
            .collect();
        if offices.is_empty() {
            return Err(LocationError::NoEnabledOffices);
        }
        for office in &offices {
            info!(
                id = %office.id,
                name = %office.name,
                lat = office.latitude,
                lon = office.longitude,
                radius = office.radius_meters,
                "office loaded"
            );
        }
        Ok(Self { offices })
    }

    pub fn from_offices(offices: Vec<Office>) -> Result<Self, LocationError> {
        let offices: Vec<Office> = offices.into_iter().filter(|o| o.enabled).collect();
        if offices.is_empty() {
            return Err(LocationError::NoEnabledOffices);
        }
        Ok(Self { offices })
    }

    pub fn offices(&self) -> &[Office] {
        &self.offices
    }

    pub fn nearest(&self, lat: f64, lon: f64) -> Option<OfficeMatch> {
        self.offices
            .iter()
            .map(|office| {
                let distance = haversine(office.latitude, office.longitude, lat, lon);
                OfficeMatch {
                    within_radius: distance <= office.radius_meters,
                    office: office.clone(),
                    distance,
                }
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }

    /// Accept the position iff it is inside the nearest office's radius.
    /// (0,0) and out-of-range coordinates are always rejected.
    pub fn validate(&self, lat: f64, lon: f64) -> bool {
        if lat == 0.0 && lon == 0.0 {
            warn!("rejecting null island coordinates");
            return false;
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            warn!(lat, lon, "coordinates out of range");
            return false;
        }
        let Some(nearest) = self.nearest(lat, lon) else {
            warn!("no offices configured");
            return false;
        };
        info!(
            office = %nearest.office.name,
            distance = format!("{:.2}", nearest.distance),
            radius = nearest.office.radius_meters,
            valid = nearest.within_radius,
            "location checked"
        );
        if !nearest.within_radius {
            for office in &self.offices {
                if office.id != nearest.office.id {
                    let distance = haversine(office.latitude, office.longitude, lat, lon);
                    debug!(office = %office.name, distance = format!("{distance:.2}"), "other office");
                }
            }
        }
        nearest.within_radius
    }
}

fn default_offices() -> Vec<Office> {
    let office = |id: &str, name: &str, latitude: f64, longitude: f64| Office {
        id: id.into(),
        name: name.into(),
        latitude,
        longitude,
        radius_meters: 100.0,
        enabled: true,
    };
    vec![
        office(
            "HN1",
            "Văn phòng Hà Nội 1 - 2nd Floor, CT3 The Pride, To Huu Street, Ha Dong, Ha Noi",
            20.9725054,
            105.7575887,
        ),
        office(
            "HN2",
            "Văn phòng Hà Nội 2 - 7th Floor, VinFast My Dinh Building, 8 Pham Hung Street, Tu Liem, Ha Noi",
            21.033618,
            105.7796304,
        ),
        office(
            "HN3",
            "Văn phòng Hà Nội 3 - 8th Floor, Vinaconex Diamond Tower, 459C Bach Mai street, Bach Mai, Ha Noi",
            21.0019608,
            105.8466433,
        ),
        office(
            "DN",
            "Văn phòng Đà Nẵng - NCC Building, 498 - 500 Nguyen Huu Tho Street, Cam Le, Da Nang",
            16.0293578,
            108.2086351,
        ),
        office(
            "HCM",
            "Văn phòng TP.HCM - 8th Floor, ST. MORITZ Tower, 1014 Pham Van Dong Street, Hiep Binh, Ho Chi Minh City",
            10.8380556,
            106.7351069,
        ),
        office(
            "VINH",
            "Văn phòng Vinh - 4th Floor, HD Building, Vinh – Cua Lo Boulevard, Block 17, Vinh Phu Ward, Nghe An",
            18.7007581,
            105.6798281,
        ),
        office(
            "QN",
            "Văn phòng Quy Nhơn - 3rd Floor, Hibecco Building, 307 Nguyen Thi Minh Khai Street, Quy Nhon Nam, Gia Lai",
            13.760556,
            109.213177,
        ),
    ]
}

/// Great-circle distance between two points, in meters.
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_METERS * c
}

/// Extract coordinates from a Google Maps URL. Supports the `q=lat,lon`
/// query form and the `/@lat,lon,zoom` path form.
pub fn parse_google_maps_url(map_url: &str) -> Result<(f64, f64), LocationError> {
    if map_url.is_empty() {
        return Err(LocationError::NoCoordinates);
    }
    let parsed = Url::parse(map_url)
        .map_err(|err| LocationError::InvalidCoordinates(format!("bad url: {err}")))?;

    if let Some(query) = parsed
        .query_pairs()
        .find(|(key, _)| key == "q")
        .map(|(_, value)| value.to_string())
    {
        return parse_coordinates(&query);
    }

    if let Some((_, after)) = parsed.path().split_once("/@") {
        let mut parts = after.split(',');
        if let (Some(lat), Some(lon)) = (parts.next(), parts.next()) {
            return parse_coordinates(&format!("{lat},{lon}"));
        }
    }

    Err(LocationError::NoCoordinates)
}

fn parse_coordinates(coords: &str) -> Result<(f64, f64), LocationError> {
    let mut parts = coords.split(',');
    let (Some(lat_raw), Some(lon_raw), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(LocationError::InvalidCoordinates(format!(
            "expected 'lat,lon', got '{coords}'"
        )));
    };
    let lat: f64 = lat_raw
        .trim()
        .parse()
        .map_err(|_| LocationError::InvalidCoordinates(format!("bad latitude '{lat_raw}'")))?;
    let lon: f64 = lon_raw
        .trim()
        .parse()
        .map_err(|_| LocationError::InvalidCoordinates(format!("bad longitude '{lon_raw}'")))?;
    if !(-90.0..=90.0).contains(&lat) {
        return Err(LocationError::InvalidCoordinates(format!(
            "latitude {lat} out of range"
        )));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(LocationError::InvalidCoordinates(format!(
            "longitude {lon} out of range"
        )));
    }
    Ok((lat, lon))
}

/// Message body of a channel message, as far as location handling cares.
#[derive(Debug, Default, Deserialize)]
struct MessageBody {
    #[serde(default)]
    t: String,
}

/// Pull coordinates out of a channel-message body. A body that fails JSON
/// parsing is never a location message.
pub fn extract_location(content_json: &str) -> Option<(f64, f64)> {
    let body: MessageBody = serde_json::from_str(content_json).ok()?;
    if !body.t.contains("google.com/maps") {
        return None;
    }
    parse_google_maps_url(body.t.trim()).ok()
}

/// One armed confirmation window.
pub struct ConfirmationState {
    pub user_id: i64,
    pub channel_id: i64,
    confirmed: AtomicBool,
    fired: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ConfirmationState {
    fn new(user_id: i64, channel_id: i64) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            channel_id,
            confirmed: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            timer: Mutex::new(None),
        })
    }

    /// One-shot latch shared by the reply path, the timer, and shutdown.
    /// The first caller wins.
    pub fn fire_once(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }

    pub fn mark_confirmed(&self) {
        self.confirmed.store(true, Ordering::SeqCst);
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::SeqCst)
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}

/// Pending confirmations keyed by user id. At most one per user; arming a
/// new one cancels its predecessor.
#[derive(Default)]
pub struct ConfirmationRegistry {
    states: Mutex<HashMap<i64, Arc<ConfirmationState>>>,
}

impl ConfirmationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a confirmation window and return the state. `on_timeout` runs on
    /// its own task when the window elapses without a reply.
    pub fn arm<F>(
        &self,
        user_id: i64,
        channel_id: i64,
        timeout: Duration,
        on_timeout: F,
    ) -> Arc<ConfirmationState>
    where
        F: FnOnce() + Send + 'static,
    {
        let state = ConfirmationState::new(user_id, channel_id);
        let timer_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if timer_state.fire_once() {
                on_timeout();
            }
        });
        *state.timer.lock() = Some(handle);

        if let Some(previous) = self.states.lock().insert(user_id, Arc::clone(&state)) {
            previous.fire_once();
            previous.cancel_timer();
            debug!(user_id, "replaced pending confirmation");
        }
        info!(user_id, timeout = ?timeout, "confirmation timer armed");
        state
    }

    /// Claim the pending confirmation for a reply. Returns `None` when no
    /// window is armed or the timer already won; late and duplicate replies
    /// are no-ops either way.
    pub fn take_for_reply(&self, user_id: i64) -> Option<Arc<ConfirmationState>> {
        let mut states = self.states.lock();
        let state = Arc::clone(states.get(&user_id)?);
        if !state.fire_once() {
            // Timer beat the reply; the timeout handler still owns the entry.
            return None;
        }
        states.remove(&user_id);
        drop(states);
        state.mark_confirmed();
        state.cancel_timer();
        Some(state)
    }

    /// Claim the pending confirmation from the timer path. Returns `None`
    /// when the user already confirmed or the state is gone.
    pub fn take_for_timeout(&self, user_id: i64) -> Option<Arc<ConfirmationState>> {
        let mut states = self.states.lock();
        let state = states.get(&user_id)?;
        if state.is_confirmed() {
            let state = states.remove(&user_id);
            drop(states);
            if let Some(state) = state {
                state.cancel_timer();
            }
            return None;
        }
        states.remove(&user_id)
    }

    /// Drop every pending confirmation, silencing their timers.
    pub fn cancel_all(&self) {
        let drained: Vec<Arc<ConfirmationState>> =
            self.states.lock().drain().map(|(_, state)| state).collect();
        for state in drained {
            state.fire_once();
            state.cancel_timer();
        }
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_office() -> Office {
        Office {
            id: "HN1".into(),
            name: "Hanoi office".into(),
            latitude: 20.9725054,
            longitude: 105.7575887,
            radius_meters: 100.0,
            enabled: true,
        }
    }

    #[test]
    fn haversine_zero_for_identical_points() {
        assert_eq!(haversine(21.0, 105.0, 21.0, 105.0), 0.0);
    }

    #[test]
    fn haversine_antipodes_approximate_half_circumference() {
        let distance = haversine(0.0, 0.0, 0.0, 180.0);
        let half_circumference = std::f64::consts::PI * EARTH_RADIUS_METERS;
        assert!((distance - half_circumference).abs() < 1.0);
    }

    #[test]
    fn validator_accepts_point_inside_radius() {
        let directory = OfficeDirectory::from_offices(vec![test_office()]).unwrap();
        assert!(directory.validate(20.97251, 105.75759));
    }

    #[test]
    fn validator_rejects_point_outside_radius() {
        let directory = OfficeDirectory::from_offices(vec![test_office()]).unwrap();
        assert!(!directory.validate(20.973, 105.759));
    }

    #[test]
    fn validator_rejects_null_island_and_out_of_range() {
        let mut global = test_office();
        global.latitude = 0.0;
        global.longitude = 0.0;
        global.radius_meters = f64::MAX;
        let directory = OfficeDirectory::from_offices(vec![global]).unwrap();
        assert!(!directory.validate(0.0, 0.0));
        assert!(!directory.validate(91.0, 0.1));
        assert!(!directory.validate(0.1, 181.0));
    }

    #[test]
    fn directory_requires_an_enabled_office() {
        let mut office = test_office();
        office.enabled = false;
        assert!(matches!(
            OfficeDirectory::from_offices(vec![office]),
            Err(LocationError::NoEnabledOffices)
        ));
    }

    #[test]
    fn offices_file_is_created_and_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("offices.json");
        let path_str = path.to_str().unwrap();

        let directory = OfficeDirectory::load(path_str).unwrap();
        assert!(!directory.offices().is_empty());
        assert!(path.exists());

        // Second load reads the file that was just written.
        let reloaded = OfficeDirectory::load(path_str).unwrap();
        assert_eq!(reloaded.offices().len(), directory.offices().len());
    }

    #[test]
    fn maps_url_query_form_parses() {
        let (lat, lon) =
            parse_google_maps_url("https://www.google.com/maps?q=18.701103,105.679654").unwrap();
        assert!((lat - 18.701103).abs() < 1e-9);
        assert!((lon - 105.679654).abs() < 1e-9);
    }

    #[test]
    fn maps_url_path_form_parses() {
        let (lat, lon) =
            parse_google_maps_url("https://www.google.com/maps/@18.701103,105.679654,14z").unwrap();
        assert!((lat - 18.701103).abs() < 1e-9);
        assert!((lon - 105.679654).abs() < 1e-9);
    }

    #[test]
    fn maps_url_rejects_bad_input() {
        assert!(parse_google_maps_url("").is_err());
        assert!(parse_google_maps_url("https://www.google.com/maps").is_err());
        assert!(parse_google_maps_url("https://www.google.com/maps?q=99,200").is_err());
        assert!(parse_google_maps_url("not a url").is_err());
    }

    #[test]
    fn extract_location_requires_valid_json() {
        assert_eq!(extract_location("not json{"), None);
        assert_eq!(extract_location(r#"{"t":"hello"}"#), None);
        let found =
            extract_location(r#"{"t":"https://www.google.com/maps?q=20.97,105.75"}"#).unwrap();
        assert!((found.0 - 20.97).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reply_wins_over_timer() {
        let registry = ConfirmationRegistry::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.arm(7, 9, Duration::from_secs(60), move || {
            let _ = tx.send(());
        });

        let state = registry.take_for_reply(7).expect("pending state");
        assert!(state.is_confirmed());
        assert!(registry.is_empty());

        // Late second reply is a no-op.
        assert!(registry.take_for_reply(7).is_none());
        // Timer never fires.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn timer_fires_once_and_late_reply_is_ignored() {
        let registry = Arc::new(ConfirmationRegistry::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.arm(7, 9, Duration::from_millis(20), move || {
            let _ = tx.send(());
        });

        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timer fires")
            .expect("channel open");

        // The timeout handler claims the state...
        assert!(registry.take_for_timeout(7).is_some());
        // ...after which a late reply finds nothing.
        assert!(registry.take_for_reply(7).is_none());
    }

    #[tokio::test]
    async fn rearming_cancels_the_previous_window() {
        let registry = ConfirmationRegistry::new();
        let (tx1, mut rx1) = tokio::sync::mpsc::unbounded_channel();
        registry.arm(7, 9, Duration::from_millis(20), move || {
            let _ = tx1.send(());
        });
        let (tx2, _rx2) = tokio::sync::mpsc::unbounded_channel::<()>();
        registry.arm(7, 9, Duration::from_secs(60), move || {
            let _ = tx2.send(());
        });

        assert_eq!(registry.len(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        // The first timer was latched out before it could fire.
        assert!(rx1.try_recv().is_err());
    }
}
