use crate::models::driver_request::GeoPoint;

/// Axis-aligned coordinate window of `radius_degrees` on each side of a
/// centre. Used instead of great-circle distance; it does not wrap at the
/// antimeridian and widens in real distance towards the poles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn around(center: &GeoPoint, radius_degrees: f64) -> Self {
        let radius = radius_degrees.abs();
        Self {
            min_lat: center.lat - radius,
            max_lat: center.lat + radius,
            min_lng: center.lng - radius,
            max_lng: center.lng + radius,
        }
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.lat >= self.min_lat
            && point.lat <= self.max_lat
            && point.lng >= self.min_lng
            && point.lng <= self.max_lng
    }
}

#[cfg(test)]
mod tests {
    use super::BoundingBox;
    use crate::models::driver_request::GeoPoint;

    #[test]
    fn nearby_point_is_inside() {
        let driver = GeoPoint { lat: 9.00, lng: 38.74 };
        let cargo = GeoPoint { lat: 9.001, lng: 38.741 };
        assert!(BoundingBox::around(&driver, 0.01).contains(&cargo));
    }

    #[test]
    fn edge_of_the_box_is_inclusive() {
        let center = GeoPoint { lat: 0.0, lng: 0.0 };
        let edge = GeoPoint { lat: 0.5, lng: -0.5 };
        assert!(BoundingBox::around(&center, 0.5).contains(&edge));
    }

    #[test]
    fn point_a_few_kilometres_away_is_outside() {
        let driver = GeoPoint { lat: 9.00, lng: 38.74 };
        let cargo = GeoPoint { lat: 9.05, lng: 38.74 };
        assert!(!BoundingBox::around(&driver, 0.01).contains(&cargo));
    }

    #[test]
    fn box_does_not_wrap_across_the_antimeridian() {
        let east = GeoPoint { lat: 0.0, lng: 179.999 };
        let west = GeoPoint { lat: 0.0, lng: -179.999 };
        assert!(!BoundingBox::around(&east, 0.01).contains(&west));
    }
}
