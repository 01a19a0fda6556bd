use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn synthetic_room() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;

    let mut cmd = Command::cargo_bin("procam")?;
    cmd.arg("synthetic")
        .arg(dir.path().join("room.json"))
        .arg("--depth-stride")
        .arg("8");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Ensemble with 2 cameras, 2 projectors"));

    Ok(())
}

#[test]
fn scanned_room() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let room = dir.path().join("room.json");

    let mut cmd = Command::cargo_bin("procam")?;
    cmd.arg("synthetic")
        .arg(&room)
        .arg("--scan")
        .arg("--depth-stride")
        .arg("4");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Ensemble with 2 cameras, 2 projectors, 3 point sets"));

    Ok(())
}

#[test]
fn calibrate_synthetic() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let room = dir.path().join("room.json");
    let calibrated = dir.path().join("calibrated.json");

    let mut cmd = Command::cargo_bin("procam")?;
    cmd.arg("synthetic")
        .arg(&room)
        .arg("--depth-stride")
        .arg("6")
        .arg("--outliers")
        .arg("0");
    cmd.assert().success();

    let mut cmd = Command::cargo_bin("procam")?;
    cmd.arg("calibrate")
        .arg(&room)
        .arg(&calibrated)
        .arg("--min-inliers")
        .arg("100")
        .arg("--max-trials")
        .arg("15");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("2/2 cameras and 2/2 projectors resolved"))
        .stdout(predicate::str::contains("Bundle adjustment over"))
        .stdout(predicate::str::contains("Reprojection RMS"));

    let mut cmd = Command::cargo_bin("procam")?;
    cmd.arg("check").arg(&calibrated);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("2/2 cameras and 2/2 projectors resolved"))
        .stdout(predicate::str::contains("has intrinsics"));

    Ok(())
}

#[test]
fn uncalibrated_check() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let room = dir.path().join("room.json");

    let mut cmd = Command::cargo_bin("procam")?;
    cmd.arg("synthetic").arg(&room).arg("--depth-stride").arg("8");
    cmd.assert().success();

    let mut cmd = Command::cargo_bin("procam")?;
    cmd.arg("check").arg(&room);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("1/2 cameras and 0/2 projectors resolved"))
        .stdout(predicate::str::contains("1 connected components"))
        .stdout(predicate::str::contains("Reprojection RMS: n/a"));

    Ok(())
}

#[test]
fn export_and_reload_correspondences() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let room = dir.path().join("room.json");

    let mut cmd = Command::cargo_bin("procam")?;
    cmd.arg("synthetic")
        .arg(&room)
        .arg("--depth-stride")
        .arg("6")
        .arg("--outliers")
        .arg("0");
    cmd.assert().success();

    for name in ["room.cps", "room.bcps"].iter() {
        let dump = dir.path().join(name);
        let mut cmd = Command::cargo_bin("procam")?;
        cmd.arg("export").arg(&room).arg(&dump);
        cmd.assert()
            .success()
            .stdout(predicate::str::contains("Wrote 3 point sets"));

        let mut cmd = Command::cargo_bin("procam")?;
        cmd.arg("calibrate")
            .arg(&room)
            .arg(dir.path().join("calibrated.json"))
            .arg("--correspondences")
            .arg(&dump)
            .arg("--min-inliers")
            .arg("100")
            .arg("--max-trials")
            .arg("15");
        cmd.assert()
            .success()
            .stdout(predicate::str::contains("3 point sets"))
            .stdout(predicate::str::contains("2/2 projectors resolved"));
    }

    Ok(())
}

#[test]
fn unknown_export_format() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let room = dir.path().join("room.json");

    let mut cmd = Command::cargo_bin("procam")?;
    cmd.arg("synthetic").arg(&room).arg("--depth-stride").arg("8");
    cmd.assert().success();

    let mut cmd = Command::cargo_bin("procam")?;
    cmd.arg("export").arg(&room).arg(dir.path().join("room.txt"));
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("unknown correspondence file extension"));

    Ok(())
}

#[test]
fn missing_input() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;

    let mut cmd = Command::cargo_bin("procam")?;
    cmd.arg("check").arg(dir.path().join("nothing.json"));
    cmd.assert().failure();

    Ok(())
}
