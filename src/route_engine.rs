use log::warn;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::models::GpsFix;

/// The device's explicit "no fix" sentinel. Excluded even though it also
/// contains a `,-`.
const NO_FIX_SENTINEL: &str = ",-,-";

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no GPS data available for this device")]
    NoFixes,
    #[error("route service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("route service returned an unusable response: {0}")]
    Service(String),
}

/// Rendering hint for the map collaborator: the first and last waypoints are
/// distinguished, everything in between gets the default marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerColor {
    Start,
    End,
    Default,
}

#[derive(Debug, Clone)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    pub popup: String,
    pub leg_distance: f64,
    pub color: MarkerColor,
}

/// An annotated route: ordered waypoints, the driving polyline, and the
/// service's overall driving distance in meters.
#[derive(Debug, Clone)]
pub struct ReconstructedRoute {
    pub waypoints: Vec<Waypoint>,
    pub polyline: Vec<(f64, f64)>,
    pub total_distance: f64,
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    geometry: String,
    distance: f64,
    legs: Vec<OsrmLeg>,
}

#[derive(Debug, Deserialize)]
struct OsrmLeg {
    distance: f64,
}

fn is_fix_line(line: &str) -> bool {
    (line.contains(",+") || line.contains(",-")) && !line.contains(NO_FIX_SENTINEL)
}

/// Parses a `status,lat,lon` line. Returns None for a malformed line, which
/// is skipped without aborting the reconstruction.
fn parse_fix_line(line: &str) -> Option<GpsFix> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 3 {
        return None;
    }
    let lat = fields[1].trim().parse::<f64>().ok()?;
    let lon = fields[2].trim().parse::<f64>().ok()?;
    Some(GpsFix {
        lat,
        lon,
        valid: true,
    })
}

/// Extracts ordered GPS fixes from stored command payloads. Store order is
/// preserved; the no-fix sentinel and malformed lines are skipped.
pub fn extract_fixes(payloads: &[String]) -> Vec<GpsFix> {
    let mut fixes = Vec::new();
    for payload in payloads {
        for line in payload.lines() {
            let line = line.trim();
            if !is_fix_line(line) {
                continue;
            }
            match parse_fix_line(line) {
                Some(fix) => fixes.push(fix),
                None => warn!("Skipping malformed GPS fix line: {}", line),
            }
        }
    }
    fixes
}

/// Client for the external driving-route service (OSRM wire format).
pub struct RouteEngine {
    http: reqwest::Client,
    base_url: String,
}

impl RouteEngine {
    /// One bounded timeout, no automatic retry: a stale route is worse than
    /// a failure.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RouteError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Builds the annotated route for an ordered fix list. With a single fix
    /// no service call is made; with none the caller gets `NoFixes`.
    pub async fn reconstruct(&self, fixes: &[GpsFix]) -> Result<ReconstructedRoute, RouteError> {
        match fixes {
            [] => Err(RouteError::NoFixes),
            [only] => Ok(single_marker_route(*only)),
            _ => {
                let route = self.fetch_route(fixes).await?;
                build_annotated_route(fixes, &route)
            }
        }
    }

    async fn fetch_route(&self, fixes: &[GpsFix]) -> Result<OsrmRoute, RouteError> {
        let coords = fixes
            .iter()
            .map(|fix| format!("{},{}", fix.lon, fix.lat))
            .collect::<Vec<_>>()
            .join(";");
        let url = format!("{}/route/v1/driving/{}", self.base_url, coords);

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RouteError::Service(format!(
                "request failed with status code {}",
                status
            )));
        }

        let body: OsrmResponse = response
            .json()
            .await
            .map_err(|e| RouteError::Service(e.to_string()))?;
        body.routes
            .into_iter()
            .next()
            .ok_or_else(|| RouteError::Service("response contained no routes".to_string()))
    }
}

fn single_marker_route(fix: GpsFix) -> ReconstructedRoute {
    ReconstructedRoute {
        waypoints: vec![Waypoint {
            lat: fix.lat,
            lon: fix.lon,
            popup: format!("Start\n({}, {})\nd2d: 0m", fix.lat, fix.lon),
            leg_distance: 0.0,
            color: MarkerColor::Default,
        }],
        polyline: vec![(fix.lat, fix.lon)],
        total_distance: 0.0,
    }
}

/// Annotates the stored fixes with the service's leg distances. Leg `i - 1`
/// is attributed to fix `i`; a response without enough legs is unusable.
fn build_annotated_route(
    fixes: &[GpsFix],
    route: &OsrmRoute,
) -> Result<ReconstructedRoute, RouteError> {
    let line = polyline::decode_polyline(&route.geometry, 5).map_err(RouteError::Service)?;
    let path: Vec<(f64, f64)> = line.0.into_iter().map(|coord| (coord.y, coord.x)).collect();

    let last = fixes.len() - 1;
    let mut waypoints = Vec::with_capacity(fixes.len());
    for (index, fix) in fixes.iter().enumerate() {
        let (popup, leg_distance, color) = if index == 0 {
            (
                format!("Start\n({}, {})\nd2d: 0.0m", fix.lat, fix.lon),
                0.0,
                MarkerColor::Start,
            )
        } else {
            let leg = route
                .legs
                .get(index - 1)
                .ok_or_else(|| {
                    RouteError::Service("response is missing leg distances".to_string())
                })?
                .distance;
            if index == last {
                (
                    format!(
                        "End\n({}, {})\nd2d: {:.1}m\nTotal: {:.1}m",
                        fix.lat, fix.lon, leg, route.distance
                    ),
                    leg,
                    MarkerColor::End,
                )
            } else {
                (
                    format!("{}\n({}, {})\nd2d: {:.1}m", index, fix.lat, fix.lon, leg),
                    leg,
                    MarkerColor::Default,
                )
            }
        };
        waypoints.push(Waypoint {
            lat: fix.lat,
            lon: fix.lon,
            popup,
            leg_distance,
            color,
        });
    }

    Ok(ReconstructedRoute {
        waypoints,
        polyline: path,
        total_distance: route.distance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_lines_are_never_fixes() {
        assert!(!is_fix_line("A,-,-"));
        assert!(!is_fix_line("A,+40.1,-,-"));
        assert!(is_fix_line("A,+40.1,-73.9"));
        assert!(is_fix_line("A,-40.1,73.9"));
        assert!(!is_fix_line("plain status line"));
    }

    #[test]
    fn extraction_parses_signed_coordinates() {
        let payloads = vec!["123\nA,+40.1,-73.9\nA,-,-\nA,+40.2,-73.8".to_string()];
        let fixes = extract_fixes(&payloads);
        assert_eq!(fixes.len(), 2);
        assert_eq!(fixes[0].lat, 40.1);
        assert_eq!(fixes[0].lon, -73.9);
        assert!(fixes[0].valid);
        assert_eq!(fixes[1].lat, 40.2);
    }

    #[test]
    fn malformed_fix_lines_are_skipped_not_fatal() {
        let payloads = vec![
            "A,+not-a-number,-73.9".to_string(),
            "A,+40.1,-73.9,extra".to_string(),
            "A,+40.5,-73.5".to_string(),
        ];
        let fixes = extract_fixes(&payloads);
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].lat, 40.5);
    }

    #[test]
    fn fixes_preserve_store_order() {
        let payloads = vec![
            "A,+1.0,-1.0".to_string(),
            "A,+2.0,-2.0".to_string(),
            "A,+3.0,-3.0".to_string(),
        ];
        let fixes = extract_fixes(&payloads);
        let lats: Vec<f64> = fixes.iter().map(|f| f.lat).collect();
        assert_eq!(lats, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn empty_fix_list_is_an_error() {
        let engine = RouteEngine::new("https://router.invalid", Duration::from_secs(1)).unwrap();
        assert!(matches!(
            engine.reconstruct(&[]).await,
            Err(RouteError::NoFixes)
        ));
    }

    #[tokio::test]
    async fn single_fix_renders_one_marker_with_zero_distance() {
        let engine = RouteEngine::new("https://router.invalid", Duration::from_secs(1)).unwrap();
        let fix = GpsFix {
            lat: 40.7,
            lon: -74.0,
            valid: true,
        };
        let route = engine.reconstruct(&[fix]).await.unwrap();
        assert_eq!(route.waypoints.len(), 1);
        assert_eq!(route.waypoints[0].leg_distance, 0.0);
        assert_eq!(route.waypoints[0].color, MarkerColor::Default);
        assert_eq!(route.polyline, vec![(40.7, -74.0)]);
        assert_eq!(route.total_distance, 0.0);
    }

    fn canned_route(legs: &[f64], total: f64) -> OsrmRoute {
        // Classic polyline example: (38.5,-120.2) (40.7,-120.95) (43.252,-126.453)
        let legs_json: Vec<String> = legs
            .iter()
            .map(|d| format!("{{\"distance\": {}}}", d))
            .collect();
        let json = format!(
            "{{\"geometry\": \"_p~iF~ps|U_ulLnnqC_mqNvxq`@\", \"distance\": {}, \"legs\": [{}]}}",
            total,
            legs_json.join(",")
        );
        serde_json::from_str(&json).unwrap()
    }

    fn fix(lat: f64, lon: f64) -> GpsFix {
        GpsFix {
            lat,
            lon,
            valid: true,
        }
    }

    #[test]
    fn annotation_attributes_leg_distances_to_stored_fixes() {
        let fixes = vec![fix(38.5, -120.2), fix(40.7, -120.95), fix(43.25, -126.45)];
        let route = canned_route(&[1200.0, 3400.0], 4600.0);

        let annotated = build_annotated_route(&fixes, &route).unwrap();
        assert_eq!(annotated.waypoints.len(), 3);

        let start = &annotated.waypoints[0];
        assert_eq!(start.color, MarkerColor::Start);
        assert_eq!(start.leg_distance, 0.0);
        assert!(start.popup.starts_with("Start"));

        let mid = &annotated.waypoints[1];
        assert_eq!(mid.color, MarkerColor::Default);
        assert_eq!(mid.leg_distance, 1200.0);
        assert!(mid.popup.starts_with("1\n"));

        let end = &annotated.waypoints[2];
        assert_eq!(end.color, MarkerColor::End);
        assert_eq!(end.leg_distance, 3400.0);
        assert!(end.popup.contains("Total: 4600.0m"));

        assert_eq!(annotated.total_distance, 4600.0);
        assert_eq!(annotated.polyline.len(), 3);
        assert!((annotated.polyline[0].0 - 38.5).abs() < 1e-5);
        assert!((annotated.polyline[0].1 - (-120.2)).abs() < 1e-5);
    }

    #[test]
    fn missing_leg_distances_fail_the_whole_reconstruction() {
        let fixes = vec![fix(38.5, -120.2), fix(40.7, -120.95), fix(43.25, -126.45)];
        let route = canned_route(&[1200.0], 4600.0);
        assert!(matches!(
            build_annotated_route(&fixes, &route),
            Err(RouteError::Service(_))
        ));
    }
}
