use markerconv_core::{Marker, MarkerSet, ModelError, Result, Voxel};
use std::fs;
use std::path::Path;

/// Read a seed file: a count line followed by one `x y z label` line per
/// marker. Blank lines are skipped; anything else malformed is a data
/// error.
pub fn read_seeds<P: AsRef<Path>>(path: P) -> Result<MarkerSet> {
    let text = fs::read_to_string(path)?;
    parse_seeds(&text)
}

/// Write a marker set in the seed-file format read by [`read_seeds`].
pub fn write_seeds<P: AsRef<Path>>(path: P, markers: &MarkerSet) -> Result<()> {
    let mut out = String::new();
    out.push_str(&format!("{}\n", markers.len()));
    for m in markers.iter() {
        out.push_str(&format!(
            "{} {} {} {}\n",
            m.voxel.x, m.voxel.y, m.voxel.z, m.label
        ));
    }
    fs::write(path, out)?;
    Ok(())
}

fn parse_seeds(text: &str) -> Result<MarkerSet> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty());
    let (_, header) = lines
        .next()
        .ok_or_else(|| ModelError::Data("seed file is empty".into()))?;
    let count: usize = header.trim().parse().map_err(|_| {
        ModelError::Data(format!("bad marker count line: '{}'", header.trim()))
    })?;

    let mut markers = Vec::with_capacity(count);
    for (lineno, line) in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(ModelError::Data(format!(
                "seed line {}: expected 4 fields, found {}",
                lineno + 1,
                fields.len()
            )));
        }
        let x = parse_coord(fields[0], lineno)?;
        let y = parse_coord(fields[1], lineno)?;
        let z = parse_coord(fields[2], lineno)?;
        let label: u32 = fields[3].parse().map_err(|_| {
            ModelError::Data(format!(
                "seed line {}: bad label '{}'",
                lineno + 1,
                fields[3]
            ))
        })?;
        markers.push(Marker::new(Voxel::new(x, y, z), label));
    }
    if markers.len() != count {
        return Err(ModelError::Data(format!(
            "header says {count} markers, file has {}",
            markers.len()
        )));
    }
    Ok(MarkerSet::new(markers))
}

fn parse_coord(field: &str, lineno: usize) -> Result<usize> {
    field.parse().map_err(|_| {
        ModelError::Data(format!(
            "seed line {}: bad coordinate '{field}'",
            lineno + 1
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_file(tag: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        dir.push(format!("markerconv_{tag}_{nanos}.txt"));
        dir
    }

    fn sample_set() -> MarkerSet {
        MarkerSet::new(vec![
            Marker::new(Voxel::new(3, 1, 0), 1),
            Marker::new(Voxel::new(0, 7, 2), 2),
            Marker::new(Voxel::new(5, 5, 5), 1),
        ])
    }

    #[test]
    fn round_trip_is_exact() {
        let path = unique_temp_file("seeds");
        let set = sample_set();
        write_seeds(&path, &set).unwrap();
        let back = read_seeds(&path).unwrap();
        assert_eq!(back, set);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn parses_the_documented_layout() {
        let set = parse_seeds("2\n4 2 0 1\n9 9 1 3\n").unwrap();
        assert_eq!(set.len(), 2);
        let markers: Vec<&Marker> = set.iter().collect();
        assert_eq!(markers[0].voxel, Voxel::new(4, 2, 0));
        assert_eq!(markers[1].label, 3);
    }

    #[test]
    fn malformed_content_is_a_data_error() {
        assert!(matches!(parse_seeds(""), Err(ModelError::Data(_))));
        assert!(matches!(parse_seeds("one\n"), Err(ModelError::Data(_))));
        assert!(matches!(
            parse_seeds("1\n4 2 1\n"),
            Err(ModelError::Data(_))
        ));
        assert!(matches!(
            parse_seeds("1\n4 2 x 1\n"),
            Err(ModelError::Data(_))
        ));
        // Header promises more markers than the file holds.
        assert!(matches!(
            parse_seeds("3\n4 2 0 1\n"),
            Err(ModelError::Data(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let path = unique_temp_file("absent");
        assert!(matches!(read_seeds(&path), Err(ModelError::Io(_))));
    }
}
