//! Geometry validation and repair.
//!
//! OSM rings are frequently malformed: unclosed, with repeated points, with
//! reversed winding, or self-touching. Repair first applies structural fixes
//! and reorients rings; geometries that remain invalid are normalized with a
//! boolean-ops pass, which resolves self-intersections into simple polygons.

use geo::orient::{Direction, Orient};
use geo::{BooleanOps, Coord, Geometry, LineString, MultiPolygon, Polygon, Validation};

/// Whether a geometry satisfies the OGC validity rules.
pub fn is_valid_geometry(geometry: &Geometry<f64>) -> bool {
    geometry.is_valid()
}

/// Repair an invalid geometry, the `ST_MakeValid` equivalent.
///
/// Valid input is returned unchanged. Polygonal input may come back as a
/// MultiPolygon when the repair splits it apart.
pub fn make_valid(geometry: Geometry<f64>) -> Geometry<f64> {
    if geometry.is_valid() {
        return geometry;
    }
    match geometry {
        Geometry::Point(point) => Geometry::Point(point),
        Geometry::LineString(line) => Geometry::LineString(clean_line(line)),
        Geometry::Polygon(polygon) => {
            multi_polygon_to_geometry(make_valid_multi_polygon(MultiPolygon::new(vec![polygon])))
        }
        Geometry::MultiPolygon(multi) => multi_polygon_to_geometry(make_valid_multi_polygon(multi)),
        other => other,
    }
}

/// Repair a multipolygon, keeping the MultiPolygon shape.
pub fn make_valid_multi_polygon(multi: MultiPolygon<f64>) -> MultiPolygon<f64> {
    if multi.is_valid() {
        return multi;
    }

    let rebuilt: Vec<Polygon<f64>> = multi.0.into_iter().filter_map(rebuild_polygon).collect();
    let rebuilt = MultiPolygon::new(rebuilt).orient(Direction::Default);
    if rebuilt.is_valid() {
        return rebuilt;
    }

    // Self-union resolves remaining self-intersections and overlaps.
    rebuilt.union(&MultiPolygon::new(Vec::new()))
}

fn multi_polygon_to_geometry(mut multi: MultiPolygon<f64>) -> Geometry<f64> {
    if multi.0.len() == 1 {
        Geometry::Polygon(multi.0.remove(0))
    } else {
        Geometry::MultiPolygon(multi)
    }
}

fn clean_line(line: LineString<f64>) -> LineString<f64> {
    LineString::from(dedup_coords(line.0))
}

fn dedup_coords(mut coords: Vec<Coord<f64>>) -> Vec<Coord<f64>> {
    coords.dedup();
    coords
}

/// Close and deduplicate the rings of one polygon; rings collapsing below
/// four points are dropped, and a polygon losing its exterior is dropped.
fn rebuild_polygon(polygon: Polygon<f64>) -> Option<Polygon<f64>> {
    let (exterior, interiors) = polygon.into_inner();
    let exterior = rebuild_ring(exterior)?;
    let interiors: Vec<LineString<f64>> =
        interiors.into_iter().filter_map(rebuild_ring).collect();
    Some(Polygon::new(exterior, interiors))
}

fn rebuild_ring(ring: LineString<f64>) -> Option<LineString<f64>> {
    let mut coords = dedup_coords(ring.0);
    if coords.len() < 3 {
        return None;
    }
    if coords.first() != coords.last() {
        let first = coords[0];
        coords.push(first);
    }
    if coords.len() < 4 {
        return None;
    }
    Some(LineString::from(coords))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{line_string, polygon, Area};

    #[test]
    fn valid_geometry_passes_through() {
        let geometry: Geometry<f64> =
            polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)]
                .into();
        assert!(is_valid_geometry(&geometry));
        assert_eq!(make_valid(geometry.clone()), geometry);
    }

    #[test]
    fn closes_open_rings() {
        let open = Polygon::new(
            line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)],
            vec![],
        );
        let repaired = make_valid(Geometry::Polygon(open));
        assert!(is_valid_geometry(&repaired));
    }

    #[test]
    fn removes_repeated_points() {
        let ring = line_string![
            (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)
        ];
        let repaired = make_valid(Geometry::Polygon(Polygon::new(ring, vec![])));
        assert!(is_valid_geometry(&repaired));
    }

    #[test]
    fn drops_degenerate_rings() {
        let multi = MultiPolygon::new(vec![
            polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)],
            Polygon::new(line_string![(x: 5.0, y: 5.0), (x: 5.0, y: 5.0)], vec![]),
        ]);
        let repaired = make_valid_multi_polygon(multi);
        assert!(repaired.is_valid());
        assert_eq!(repaired.0.len(), 1);
    }

    #[test]
    fn repaired_geometry_keeps_its_area() {
        let open = Polygon::new(
            line_string![(x: 0.0, y: 0.0), (x: 2.0, y: 0.0), (x: 2.0, y: 2.0), (x: 0.0, y: 2.0)],
            vec![],
        );
        let repaired = make_valid(Geometry::Polygon(open));
        let area = match repaired {
            Geometry::Polygon(p) => p.unsigned_area(),
            Geometry::MultiPolygon(mp) => mp.unsigned_area(),
            other => panic!("unexpected repair output: {other:?}"),
        };
        approx::assert_relative_eq!(area, 4.0);
    }
}
