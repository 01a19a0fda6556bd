//! Reading and writing ensembles and correspondence dumps.
//!
//! Ensembles (devices, poses, lenses and point sets) are stored as JSON. Correspondences alone can
//! also be dumped in a compact form, chosen by file extension:
//!
//! - `.cps`: text. A line with the number of point sets, then for each set a line
//!   `projector camera n` followed by `n` lines of `x y z u v`.
//! - `.bcps`: the same layout in big endian binary, counts as `u64` and coordinates as `f64`.
use byteorder::{BigEndian, WriteBytesExt};
use cgmath::{Point2, Point3};
use nom::character::complete::{multispace0, u64 as decimal};
use nom::multi::count;
use nom::number::complete::{be_f64, be_u64, double};
use nom::sequence::{preceded, tuple};
use nom::IResult;
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::ensemble::{CalibrationPointSet, Ensemble};
use crate::{Error, Result};

pub fn read_ensemble(path: &Path) -> Result<Ensemble> {
    let file = BufReader::new(File::open(path)?);
    let mut ensemble: Ensemble = serde_json::from_reader(file)?;
    ensemble.validate()?;
    Ok(ensemble)
}

pub fn write_ensemble(ensemble: &Ensemble, path: &Path) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut file, ensemble)?;
    file.flush()?;
    Ok(())
}

fn parse_error<I: nom::InputLength>(e: nom::Err<nom::error::Error<I>>, total: usize) -> Error {
    match e {
        nom::Err::Incomplete(_) => Error::ParseError("unexpected end of input".to_string()),
        nom::Err::Error(e) | nom::Err::Failure(e) => Error::ParseError(format!(
            "{:?} at offset {}",
            e.code,
            total - e.input.input_len()
        )),
    }
}

type RawSet = (u64, u64, Vec<(f64, f64, f64, f64, f64)>);

fn to_point_sets(raw: Vec<RawSet>) -> Result<Vec<CalibrationPointSet>> {
    raw.into_iter()
        .map(|(projector, camera, points)| {
            let (world, image) = points
                .into_iter()
                .map(|(x, y, z, u, v)| (Point3::new(x, y, z), Point2::new(u, v)))
                .unzip();
            CalibrationPointSet::new(projector as usize, camera as usize, world, image)
        })
        .collect()
}

pub fn read_correspondences_text(path: &Path) -> Result<Vec<CalibrationPointSet>> {
    fn parse_internal(input: &str) -> IResult<&str, Vec<RawSet>> {
        fn set(input: &str) -> IResult<&str, RawSet> {
            let (input, projector) = preceded(multispace0, decimal)(input)?;
            let (input, camera) = preceded(multispace0, decimal)(input)?;
            let (input, n) = preceded(multispace0, decimal)(input)?;
            let (input, points) = count(
                tuple((
                    preceded(multispace0, double),
                    preceded(multispace0, double),
                    preceded(multispace0, double),
                    preceded(multispace0, double),
                    preceded(multispace0, double),
                )),
                n as usize,
            )(input)?;
            Ok((input, (projector, camera, points)))
        }

        let (input, num_sets) = preceded(multispace0, decimal)(input)?;
        let (input, sets) = count(set, num_sets as usize)(input)?;
        let (input, _) = multispace0(input)?;
        Ok((input, sets))
    }

    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;
    let (rest, raw) = parse_internal(&contents).map_err(|e| parse_error(e, contents.len()))?;
    if !rest.is_empty() {
        return Err(Error::ParseError(format!(
            "trailing data at offset {}",
            contents.len() - rest.len()
        )));
    }
    to_point_sets(raw)
}

pub fn read_correspondences_binary(path: &Path) -> Result<Vec<CalibrationPointSet>> {
    fn parse_internal(input: &[u8]) -> IResult<&[u8], Vec<RawSet>> {
        fn set(input: &[u8]) -> IResult<&[u8], RawSet> {
            let (input, projector) = be_u64(input)?;
            let (input, camera) = be_u64(input)?;
            let (input, n) = be_u64(input)?;
            let (input, points) =
                count(tuple((be_f64, be_f64, be_f64, be_f64, be_f64)), n as usize)(input)?;
            Ok((input, (projector, camera, points)))
        }

        let (input, num_sets) = be_u64(input)?;
        count(set, num_sets as usize)(input)
    }

    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;
    let (rest, raw) =
        parse_internal(contents.as_slice()).map_err(|e| parse_error(e, contents.len()))?;
    if !rest.is_empty() {
        return Err(Error::ParseError(format!(
            "trailing data at offset {}",
            contents.len() - rest.len()
        )));
    }
    to_point_sets(raw)
}

pub fn write_correspondences_text(ensemble: &Ensemble, path: &Path) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    writeln!(&mut file, "{}", ensemble.point_sets().len())?;
    for set in ensemble.point_sets() {
        writeln!(&mut file, "{} {} {}", set.projector, set.camera, set.len())?;
        for (w, uv) in set.world_points.iter().zip(set.image_points.iter()) {
            writeln!(&mut file, "{} {} {} {} {}", w.x, w.y, w.z, uv.x, uv.y)?;
        }
    }
    file.flush()?;
    Ok(())
}

pub fn write_correspondences_binary(ensemble: &Ensemble, path: &Path) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    file.write_u64::<BigEndian>(ensemble.point_sets().len() as u64)?;
    for set in ensemble.point_sets() {
        file.write_u64::<BigEndian>(set.projector as u64)?;
        file.write_u64::<BigEndian>(set.camera as u64)?;
        file.write_u64::<BigEndian>(set.len() as u64)?;
        for (w, uv) in set.world_points.iter().zip(set.image_points.iter()) {
            file.write_f64::<BigEndian>(w.x)?;
            file.write_f64::<BigEndian>(w.y)?;
            file.write_f64::<BigEndian>(w.z)?;
            file.write_f64::<BigEndian>(uv.x)?;
            file.write_f64::<BigEndian>(uv.y)?;
        }
    }
    file.flush()?;
    Ok(())
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("")
}

/// Read a `.cps` or `.bcps` correspondence dump.
pub fn read_correspondences(path: &Path) -> Result<Vec<CalibrationPointSet>> {
    match extension(path) {
        "cps" => read_correspondences_text(path),
        "bcps" => read_correspondences_binary(path),
        ext => Err(Error::InvalidInput(format!(
            "unknown correspondence file extension {:?}",
            ext
        ))),
    }
}

/// Write every point set of `ensemble` as a `.cps` or `.bcps` dump.
pub fn write_correspondences(ensemble: &Ensemble, path: &Path) -> Result<()> {
    match extension(path) {
        "cps" => write_correspondences_text(ensemble, path),
        "bcps" => write_correspondences_binary(ensemble, path),
        ext => Err(Error::InvalidInput(format!(
            "unknown correspondence file extension {:?}",
            ext
        ))),
    }
}

/// Replace the point sets of `ensemble` with the ones in a dump. Previous fits are lost. On error
/// the ensemble is left untouched.
pub fn load_correspondences(ensemble: &mut Ensemble, path: &Path) -> Result<usize> {
    let sets = read_correspondences(path)?;
    if let Some(set) = sets
        .iter()
        .find(|s| s.projector >= ensemble.num_projectors() || s.camera >= ensemble.num_cameras())
    {
        return Err(Error::InvalidInput(format!(
            "{} refers to projector {} and camera {}, ensemble has {} projectors and {} cameras",
            path.display(),
            set.projector,
            set.camera,
            ensemble.num_projectors(),
            ensemble.num_cameras()
        )));
    }
    let n = sets.len();
    ensemble.clear_point_sets();
    for set in sets {
        ensemble.insert_point_set(set)?;
    }
    log::info!("loaded {} point sets from {}", n, path.display());
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_model::CameraModel;
    use crate::ensemble::{Camera, Projector};
    use crate::pose::from_rt;
    use cgmath::Vector3;
    use tempfile::tempdir;

    fn ensemble() -> Ensemble {
        let mut e = Ensemble::new();
        let model = CameraModel::new(365.0, 365.0, 256.0, 212.0).with_distortion(0.1, -0.2);
        e.add_camera(Camera::new("cam0", model, (512, 424)));
        e.add_camera(Camera::new("cam1", model, (512, 424)));
        e.add_projector(Projector::new("proj0", 1024, 768).with_model(CameraModel::new(1400.0, 1400.0, 512.0, 700.0)));
        for camera in 0..2 {
            let world = (0..7)
                .map(|i| Point3::new(0.1 * i as f64, -0.25, 2.0 + 1.0 / 3.0))
                .collect();
            let image = (0..7)
                .map(|i| Point2::new(100.5 + i as f64, 200.125 * camera as f64))
                .collect();
            let mut set = CalibrationPointSet::new(0, camera, world, image).unwrap();
            set.set_fit(from_rt(Vector3::new(0.1, 0.2, 0.3), Vector3::new(1.0, 2.0, 3.0)), &[0, 2, 4]);
            e.insert_point_set(set).unwrap();
        }
        e.cameras[0].pose = Some(from_rt(Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0)));
        e
    }

    #[test]
    fn test_json_keeps_fits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("room.json");
        let e = ensemble();
        write_ensemble(&e, &path).unwrap();
        let read = read_ensemble(&path).unwrap();
        assert_eq!(read.cameras[0].pose, e.cameras[0].pose);
        assert_eq!(read.cameras[1].pose, None);
        assert_eq!(read.projectors[0].model, e.projectors[0].model);
        assert_eq!(read.point_set(0, 1).unwrap().pose, e.point_set(0, 1).unwrap().pose);
        assert_eq!(read.point_set(0, 1).unwrap().world_point_inliers.len(), 3);
    }

    #[test]
    fn test_dumps_agree() {
        let dir = tempdir().unwrap();
        let e = ensemble();
        for name in ["sets.cps", "sets.bcps"].iter() {
            let path = dir.path().join(name);
            write_correspondences(&e, &path).unwrap();
            let sets = read_correspondences(&path).unwrap();
            assert_eq!(sets.len(), 2);
            assert_eq!(sets[1].camera, 1);
            assert_eq!(sets[1].world_points, e.point_set(0, 1).unwrap().world_points);
            assert_eq!(sets[1].image_points, e.point_set(0, 1).unwrap().image_points);
            assert!(sets[1].pose.is_none());
        }
    }

    #[test]
    fn test_bad_text_dump() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.cps");
        std::fs::write(&path, "1\n0 0 2\n1 2 3 4 5\n").unwrap();
        assert!(matches!(read_correspondences(&path), Err(Error::ParseError(_))));
        std::fs::write(&path, "1\n0 0 1\n1 2 3 4 5\nextra").unwrap();
        assert!(matches!(read_correspondences(&path), Err(Error::ParseError(_))));
        assert!(read_correspondences(&dir.path().join("x.txt")).is_err());
    }

    #[test]
    fn test_load_rejects_unknown_devices() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sets.cps");
        // the first set is fine, the second names a missing projector
        std::fs::write(&path, "2\n0 1 1\n1 2 3 4 5\n3 0 1\n1 2 3 4 5\n").unwrap();
        let mut e = ensemble();
        assert!(matches!(load_correspondences(&mut e, &path), Err(Error::InvalidInput(_))));
        assert_eq!(e.point_sets().len(), 2);
        assert_eq!(e.point_set(0, 1).unwrap().len(), 7);
        assert!(e.point_set(0, 1).unwrap().pose.is_some());
    }

    #[test]
    fn test_bad_binary_dump() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sets.bcps");
        write_correspondences(&ensemble(), &path).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.push(0);
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(read_correspondences(&path), Err(Error::ParseError(_))));
        bytes.truncate(bytes.len() - 9);
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(read_correspondences(&path), Err(Error::ParseError(_))));
    }
}
