//! Minimal WKB encoder/decoder for the geometry types the pipeline emits:
//! Point, LineString, Polygon and MultiPolygon.

use std::io::{Cursor, Read, Write};

use geo::{Coord, Geometry, LineString, MultiPolygon, Point, Polygon};

use crate::error::{Error, Result};

/// WKB byte order: little endian
const WKB_LE: u8 = 1;

const WKB_POINT: u32 = 1;
const WKB_LINESTRING: u32 = 2;
const WKB_POLYGON: u32 = 3;
const WKB_MULTIPOLYGON: u32 = 6;

/// Encode a geometry to little-endian WKB.
pub fn write_geometry(geometry: &Geometry<f64>) -> Result<Vec<u8>> {
    let mut wkb = Vec::new();
    match geometry {
        Geometry::Point(point) => {
            write_header(&mut wkb, WKB_POINT)?;
            write_coord(&mut wkb, &point.0)?;
        }
        Geometry::LineString(line) => {
            write_header(&mut wkb, WKB_LINESTRING)?;
            write_ring(&mut wkb, line)?;
        }
        Geometry::Polygon(polygon) => {
            write_header(&mut wkb, WKB_POLYGON)?;
            write_polygon_body(&mut wkb, polygon)?;
        }
        Geometry::MultiPolygon(multi) => {
            write_header(&mut wkb, WKB_MULTIPOLYGON)?;
            wkb.write_all(&(multi.0.len() as u32).to_le_bytes())?;
            for polygon in &multi.0 {
                write_header(&mut wkb, WKB_POLYGON)?;
                write_polygon_body(&mut wkb, polygon)?;
            }
        }
        other => {
            return Err(Error::Internal(format!(
                "unsupported geometry type for WKB encoding: {other:?}"
            )))
        }
    }
    Ok(wkb)
}

/// Decode a WKB geometry.
pub fn read_geometry(bytes: &[u8]) -> Result<Geometry<f64>> {
    let mut cursor = Cursor::new(bytes);
    read_geometry_from(&mut cursor)
}

/// The GeoParquet name of a geometry type.
pub fn geometry_type_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        _ => "GeometryCollection",
    }
}

fn write_header(wkb: &mut Vec<u8>, geometry_type: u32) -> Result<()> {
    wkb.write_all(&[WKB_LE])?;
    wkb.write_all(&geometry_type.to_le_bytes())?;
    Ok(())
}

fn write_coord(wkb: &mut Vec<u8>, coord: &Coord<f64>) -> Result<()> {
    wkb.write_all(&coord.x.to_le_bytes())?;
    wkb.write_all(&coord.y.to_le_bytes())?;
    Ok(())
}

fn write_ring(wkb: &mut Vec<u8>, ring: &LineString<f64>) -> Result<()> {
    wkb.write_all(&(ring.0.len() as u32).to_le_bytes())?;
    for coord in &ring.0 {
        write_coord(wkb, coord)?;
    }
    Ok(())
}

fn write_polygon_body(wkb: &mut Vec<u8>, polygon: &Polygon<f64>) -> Result<()> {
    let num_rings = (1 + polygon.interiors().len()) as u32;
    wkb.write_all(&num_rings.to_le_bytes())?;
    write_ring(wkb, polygon.exterior())?;
    for interior in polygon.interiors() {
        write_ring(wkb, interior)?;
    }
    Ok(())
}

fn read_geometry_from(cursor: &mut Cursor<&[u8]>) -> Result<Geometry<f64>> {
    let is_le = read_byte_order(cursor)?;
    let geometry_type = read_u32(cursor, is_le)?;
    match geometry_type {
        WKB_POINT => {
            let (x, y) = read_coord(cursor, is_le)?;
            Ok(Geometry::Point(Point::new(x, y)))
        }
        WKB_LINESTRING => Ok(Geometry::LineString(read_ring(cursor, is_le)?)),
        WKB_POLYGON => Ok(Geometry::Polygon(read_polygon_body(cursor, is_le)?)),
        WKB_MULTIPOLYGON => {
            let count = read_u32(cursor, is_le)?;
            let mut polygons = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let inner_le = read_byte_order(cursor)?;
                let inner_type = read_u32(cursor, inner_le)?;
                if inner_type != WKB_POLYGON {
                    return Err(Error::Internal(format!(
                        "expected Polygon inside MultiPolygon, got type {inner_type}"
                    )));
                }
                polygons.push(read_polygon_body(cursor, inner_le)?);
            }
            Ok(Geometry::MultiPolygon(MultiPolygon::new(polygons)))
        }
        other => Err(Error::Internal(format!("unsupported WKB geometry type: {other}"))),
    }
}

fn read_byte_order(cursor: &mut Cursor<&[u8]>) -> Result<bool> {
    let mut byte_order = [0u8; 1];
    cursor.read_exact(&mut byte_order)?;
    Ok(byte_order[0] == WKB_LE)
}

fn read_u32(cursor: &mut Cursor<&[u8]>, is_le: bool) -> Result<u32> {
    let mut bytes = [0u8; 4];
    cursor.read_exact(&mut bytes)?;
    Ok(if is_le { u32::from_le_bytes(bytes) } else { u32::from_be_bytes(bytes) })
}

fn read_f64(cursor: &mut Cursor<&[u8]>, is_le: bool) -> Result<f64> {
    let mut bytes = [0u8; 8];
    cursor.read_exact(&mut bytes)?;
    Ok(if is_le { f64::from_le_bytes(bytes) } else { f64::from_be_bytes(bytes) })
}

fn read_coord(cursor: &mut Cursor<&[u8]>, is_le: bool) -> Result<(f64, f64)> {
    let x = read_f64(cursor, is_le)?;
    let y = read_f64(cursor, is_le)?;
    Ok((x, y))
}

fn read_ring(cursor: &mut Cursor<&[u8]>, is_le: bool) -> Result<LineString<f64>> {
    let count = read_u32(cursor, is_le)?;
    let mut coords = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (x, y) = read_coord(cursor, is_le)?;
        coords.push(Coord { x, y });
    }
    Ok(LineString::from(coords))
}

fn read_polygon_body(cursor: &mut Cursor<&[u8]>, is_le: bool) -> Result<Polygon<f64>> {
    let num_rings = read_u32(cursor, is_le)?;
    if num_rings == 0 {
        return Err(Error::Internal("polygon must have at least one ring".into()));
    }
    let exterior = read_ring(cursor, is_le)?;
    let mut interiors = Vec::with_capacity((num_rings - 1) as usize);
    for _ in 1..num_rings {
        interiors.push(read_ring(cursor, is_le)?);
    }
    Ok(Polygon::new(exterior, interiors))
}
