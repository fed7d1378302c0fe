/// The `owners` hash value format (spec §3): `"<worker_queue_key>|<initial_reservation_time>|<last_heartbeat_time>"`.
#[derive(Clone, Debug, PartialEq)]
pub struct OwnerRecord {
    pub worker_queue_key: String,
    pub initial_reservation_time: f64,
    pub last_heartbeat_time: f64,
}

impl OwnerRecord {
    pub fn new(worker_queue_key: String, now: f64) -> Self {
        Self {
            worker_queue_key,
            initial_reservation_time: now,
            last_heartbeat_time: now,
        }
    }

    pub fn to_wire(&self) -> String {
        format!(
            "{}|{}|{}",
            self.worker_queue_key, self.initial_reservation_time, self.last_heartbeat_time
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '|');
        let worker_queue_key = parts.next()?.to_string();
        let initial_reservation_time: f64 = parts.next()?.parse().ok()?;
        let last_heartbeat_time: f64 = parts.next()?.parse().ok()?;
        Some(Self {
            worker_queue_key,
            initial_reservation_time,
            last_heartbeat_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_format() {
        let rec = OwnerRecord {
            worker_queue_key: "build:b1:worker:w1:queue".into(),
            initial_reservation_time: 100.0,
            last_heartbeat_time: 105.5,
        };
        let wire = rec.to_wire();
        assert_eq!(OwnerRecord::parse(&wire), Some(rec));
    }
}
