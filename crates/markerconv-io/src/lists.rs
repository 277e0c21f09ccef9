use markerconv_core::{ModelError, Result};
use std::fs::File;
use std::path::Path;

/// Read an image list: one identifier per CSV record, no header row.
pub fn read_image_list<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let file = File::open(path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(file);
    let mut ids = Vec::new();
    for record in rdr.records() {
        let record = record.map_err(|e| ModelError::Data(format!("image list: {e}")))?;
        let id = record
            .get(0)
            .ok_or_else(|| ModelError::Data("image list: empty record".into()))?;
        ids.push(id.trim().to_string());
    }
    Ok(ids)
}

/// Write an image list in the format read by [`read_image_list`].
pub fn write_image_list<P: AsRef<Path>>(path: P, ids: &[String]) -> Result<()> {
    let file = File::create(path)?;
    let mut wtr = csv::Writer::from_writer(file);
    for id in ids {
        wtr.write_record([id.as_str()])
            .map_err(|e| ModelError::Data(format!("image list: {e}")))?;
    }
    wtr.flush()?;
    Ok(())
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
        dir.push(format!("markerconv_{tag}_{nanos}.csv"));
        dir
    }

    #[test]
    fn list_round_trip() {
        let path = unique_temp_file("list");
        let ids = vec![
            "scan_0001".to_string(),
            "scan_0002".to_string(),
            "scan_0214".to_string(),
        ];
        write_image_list(&path, &ids).unwrap();
        assert_eq!(read_image_list(&path).unwrap(), ids);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_list_is_an_io_error() {
        let path = unique_temp_file("absent");
        assert!(matches!(read_image_list(&path), Err(ModelError::Io(_))));
    }

    #[test]
    fn extra_columns_keep_only_the_identifier() {
        let path = unique_temp_file("extra");
        std::fs::write(&path, "scan_0001,ignored\nscan_0002,also\n").unwrap();
        assert_eq!(
            read_image_list(&path).unwrap(),
            vec!["scan_0001".to_string(), "scan_0002".to_string()]
        );
        std::fs::remove_file(&path).unwrap();
    }
}
