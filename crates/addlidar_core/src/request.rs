//! Processing requests and the argument list handed to the point cloud CLI.
//!
//! [`build_arguments`] is pure: the same request always yields the same list,
//! one token per present field, in a fixed order. Tokens are passed to the
//! container as an argv array and never joined into a shell string.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

const MAX_CRS_LEN: usize = 128;
const MAX_TAG_LEN: usize = 64;

/// A declarative point cloud processing request.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProcessingRequest {
    /// Input file, relative to the data root or absolute inside it.
    #[serde(alias = "file_path")]
    pub input_file: String,
    /// Attributes to drop. Ignored when [`Self::remove_all_attributes`] is set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_attribute: Vec<String>,
    #[serde(default)]
    pub remove_all_attributes: bool,
    #[serde(default)]
    pub remove_color: bool,
    /// Output format tag, e.g. `pcd-ascii`, `las`.
    pub format: Option<String>,
    /// Flight line index.
    pub line: Option<u32>,
    /// Maximum return index.
    pub returns: Option<u32>,
    /// Maximum number of points.
    pub number: Option<u64>,
    /// Maximum point density.
    pub density: Option<f64>,
    pub roi: Option<RegionOfInterest>,
    /// Output coordinate reference system.
    pub outcrs: Option<String>,
    /// Input coordinate reference system override.
    pub incrs: Option<String>,
}

/// Axis aligned region of interest, serialized as `min_x,min_y,max_x,max_y`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct RegionOfInterest {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl From<[f64; 4]> for RegionOfInterest {
    fn from([min_x, min_y, max_x, max_y]: [f64; 4]) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }
}

impl From<RegionOfInterest> for [f64; 4] {
    fn from(roi: RegionOfInterest) -> Self {
        [roi.min_x, roi.min_y, roi.max_x, roi.max_y]
    }
}

impl fmt::Display for RegionOfInterest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}

impl FromStr for RegionOfInterest {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ValidationError::field("roi", e.to_string()))?;

        let values: [f64; 4] = values
            .try_into()
            .map_err(|_| ValidationError::field("roi", "expected four comma separated numbers"))?;

        Ok(values.into())
    }
}

impl RegionOfInterest {
    fn validate(&self) -> Result<(), ValidationError> {
        let values: [f64; 4] = (*self).into();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ValidationError::field("roi", "values must be finite"));
        }
        if self.min_x >= self.max_x || self.min_y >= self.max_y {
            return Err(ValidationError::field(
                "roi",
                "min must be lower than max on both axes",
            ));
        }
        Ok(())
    }
}

impl ProcessingRequest {
    pub fn new(input_file: impl Into<String>) -> Self {
        Self {
            input_file: input_file.into(),
            ..Default::default()
        }
    }

    /// Checks every field and resolves `input_file` to its path inside the
    /// container's data mount. Returns the normalized request.
    pub fn validate(mut self, data_root: &str) -> Result<Self, ValidationError> {
        self.input_file = resolve_input(data_root, &self.input_file)?;

        if let Some(format) = &self.format {
            check_token("format", format, MAX_TAG_LEN, |c| {
                c.is_ascii_alphanumeric() || c == '-' || c == '_'
            })?;
        }

        if !self.remove_all_attributes {
            for attribute in &self.remove_attribute {
                check_token("remove_attribute", attribute, MAX_TAG_LEN, |c| {
                    c.is_ascii_alphanumeric() || c == '_' || c == '-'
                })?;
            }
        }

        if self
            .density
            .is_some_and(|density| !density.is_finite() || density <= 0.0)
        {
            return Err(ValidationError::field(
                "density",
                "must be a positive number",
            ));
        }

        if let Some(roi) = &self.roi {
            roi.validate()?;
        }

        for (field, crs) in [("outcrs", &self.outcrs), ("incrs", &self.incrs)] {
            if let Some(crs) = crs {
                check_token(field, crs, MAX_CRS_LEN, |c| {
                    c.is_ascii_alphanumeric() || ":_+./-".contains(c)
                })?;
            }
        }

        Ok(self)
    }
}

fn check_token(
    field: &'static str,
    value: &str,
    max_len: usize,
    allowed: impl Fn(char) -> bool,
) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::field(field, "must not be empty"));
    }
    if value.len() > max_len {
        return Err(ValidationError::field(
            field,
            format!("longer than {max_len} characters"),
        ));
    }
    if let Some(c) = value.chars().find(|c| !allowed(*c)) {
        return Err(ValidationError::field(
            field,
            format!("unsupported character {c:?}"),
        ));
    }
    Ok(())
}

/// Maps a user supplied path to the container path under `data_root`.
///
/// Relative paths are joined onto the root, absolute paths must already lie
/// under it. Parent segments are rejected outright.
pub fn resolve_input(data_root: &str, input: &str) -> Result<String, ValidationError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ValidationError::MissingInput);
    }
    if input.chars().any(char::is_control) {
        return Err(ValidationError::field(
            "input_file",
            "contains control characters",
        ));
    }

    let path = Path::new(input);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ValidationError::OutsideDataRoot {
            path: input.to_string(),
            root: data_root.to_string(),
        });
    }

    let root = data_root.trim_end_matches('/');
    let resolved = if path.is_absolute() {
        let inside = input == root || input.starts_with(&format!("{root}/"));
        if !inside {
            return Err(ValidationError::OutsideDataRoot {
                path: input.to_string(),
                root: data_root.to_string(),
            });
        }
        input.to_string()
    } else {
        format!("{root}/{}", input.trim_start_matches("./"))
    };

    if resolved.trim_end_matches('/') == root {
        return Err(ValidationError::field("input_file", "must name a file"));
    }

    Ok(resolved)
}

/// Translates a request into the ordered argument list of the point cloud CLI.
///
/// Order: `-i`, `--format`, `--remove-color`, `--remove-all-attributes` or
/// `--remove-attribute` (comma joined), `--line`, `--returns`, `--number`,
/// `--density`, `--roi`, `--outcrs`, `--incrs`.
pub fn build_arguments(request: &ProcessingRequest) -> Vec<String> {
    let mut args = vec![format!("-i={}", request.input_file)];

    if let Some(format) = &request.format {
        args.push(format!("--format={format}"));
    }
    if request.remove_color {
        args.push("--remove-color".to_string());
    }
    if request.remove_all_attributes {
        args.push("--remove-all-attributes".to_string());
    } else if !request.remove_attribute.is_empty() {
        args.push(format!(
            "--remove-attribute={}",
            request.remove_attribute.join(",")
        ));
    }
    if let Some(line) = request.line {
        args.push(format!("--line={line}"));
    }
    if let Some(returns) = request.returns {
        args.push(format!("--returns={returns}"));
    }
    if let Some(number) = request.number {
        args.push(format!("--number={number}"));
    }
    if let Some(density) = request.density {
        args.push(format!("--density={density}"));
    }
    if let Some(roi) = &request.roi {
        args.push(format!("--roi={roi}"));
    }
    if let Some(outcrs) = &request.outcrs {
        args.push(format!("--outcrs={outcrs}"));
    }
    if let Some(incrs) = &request.incrs {
        args.push(format!("--incrs={incrs}"));
    }

    args
}

/// The `-o=` token pointing the CLI at its output file.
pub fn output_argument(output_mount_path: &str, file_name: &str) -> String {
    format!(
        "-o={}/{}",
        output_mount_path.trim_end_matches('/'),
        file_name
    )
}

/// File extension of the output, taken from the leading token of the format
/// tag (`pcd-ascii` -> `pcd`). Without a format the CLI writes raw `bin`.
pub fn output_extension(format: Option<&str>) -> String {
    format
        .and_then(|f| f.split(['-', '_']).next())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "bin".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_request_maps_to_exact_arguments() {
        let request = ProcessingRequest {
            format: Some("pcd-ascii".into()),
            remove_color: true,
            ..ProcessingRequest::new("/data/sample.las")
        };

        assert_eq!(
            build_arguments(&request),
            vec!["-i=/data/sample.las", "--format=pcd-ascii", "--remove-color"]
        );
    }

    #[test]
    fn absent_fields_produce_no_tokens() {
        let request = ProcessingRequest::new("/data/a.las");
        assert_eq!(build_arguments(&request), vec!["-i=/data/a.las"]);
    }

    #[test]
    fn every_present_field_appears_once() {
        let request = ProcessingRequest {
            input_file: "/data/a.las".into(),
            remove_attribute: vec!["intensity".into(), "gps_time".into()],
            remove_all_attributes: false,
            remove_color: true,
            format: Some("las".into()),
            line: Some(3),
            returns: Some(2),
            number: Some(1_000_000),
            density: Some(12.5),
            roi: Some([1.0, 2.0, 3.5, 4.0].into()),
            outcrs: Some("EPSG:2056".into()),
            incrs: Some("EPSG:4326".into()),
        };

        let args = build_arguments(&request);
        assert_eq!(
            args,
            vec![
                "-i=/data/a.las",
                "--format=las",
                "--remove-color",
                "--remove-attribute=intensity,gps_time",
                "--line=3",
                "--returns=2",
                "--number=1000000",
                "--density=12.5",
                "--roi=1,2,3.5,4",
                "--outcrs=EPSG:2056",
                "--incrs=EPSG:4326",
            ]
        );
        assert_eq!(args, build_arguments(&request));
    }

    #[test]
    fn remove_all_attributes_wins_over_list() {
        let request = ProcessingRequest {
            remove_attribute: vec!["intensity".into()],
            remove_all_attributes: true,
            ..ProcessingRequest::new("/data/a.las")
        };

        let args = build_arguments(&request);
        assert!(args.contains(&"--remove-all-attributes".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--remove-attribute=")));
    }

    #[test]
    fn relative_input_resolves_under_data_root() {
        assert_eq!(
            resolve_input("/data", "mission/cloud.las").unwrap(),
            "/data/mission/cloud.las"
        );
        assert_eq!(
            resolve_input("/data/", "/data/cloud.las").unwrap(),
            "/data/cloud.las"
        );
    }

    #[test]
    fn input_outside_data_root_is_rejected() {
        assert!(matches!(
            resolve_input("/data", "/etc/passwd"),
            Err(ValidationError::OutsideDataRoot { .. })
        ));
        assert!(matches!(
            resolve_input("/data", "/database/x.las"),
            Err(ValidationError::OutsideDataRoot { .. })
        ));
        assert!(matches!(
            resolve_input("/data", "../secret.las"),
            Err(ValidationError::OutsideDataRoot { .. })
        ));
        assert_eq!(
            resolve_input("/data", "  "),
            Err(ValidationError::MissingInput)
        );
    }

    #[test]
    fn validation_rejects_unsafe_tokens() {
        let bad_crs = ProcessingRequest {
            outcrs: Some("EPSG:2056; rm -rf /".into()),
            ..ProcessingRequest::new("a.las")
        };
        assert!(bad_crs.validate("/data").is_err());

        let bad_density = ProcessingRequest {
            density: Some(f64::NAN),
            ..ProcessingRequest::new("a.las")
        };
        assert!(bad_density.validate("/data").is_err());

        let bad_roi = ProcessingRequest {
            roi: Some([4.0, 0.0, 1.0, 1.0].into()),
            ..ProcessingRequest::new("a.las")
        };
        assert!(bad_roi.validate("/data").is_err());
    }

    #[test]
    fn validation_normalizes_input() {
        let request = ProcessingRequest::new("cloud.las").validate("/data").unwrap();
        assert_eq!(request.input_file, "/data/cloud.las");
    }

    #[test]
    fn roi_parses_and_deserializes() {
        let roi: RegionOfInterest = "1, 2, 3, 4".parse().unwrap();
        assert_eq!(roi, [1.0, 2.0, 3.0, 4.0].into());
        assert!("1,2,3".parse::<RegionOfInterest>().is_err());

        let request: ProcessingRequest =
            serde_json::from_str(r#"{"file_path": "a.las", "roi": [0, 0, 10, 10]}"#).unwrap();
        assert_eq!(request.input_file, "a.las");
        assert_eq!(request.roi.unwrap().to_string(), "0,0,10,10");
    }

    #[test]
    fn output_extension_follows_format() {
        assert_eq!(output_extension(Some("pcd-ascii")), "pcd");
        assert_eq!(output_extension(Some("LAS")), "las");
        assert_eq!(output_extension(None), "bin");
        assert_eq!(output_argument("/output/", "x.pcd"), "-o=/output/x.pcd");
    }
}
