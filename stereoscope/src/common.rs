use candle_core::{Device, Tensor};
use clap::ValueEnum;
use flate2::read::GzDecoder;
use ndarray::Array2;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    /// Create a candle `Device` from this enum.
    pub fn to_device(&self, device_no: usize) -> candle_core::Result<Device> {
        Ok(match self {
            ComputeDevice::Metal => Device::new_metal(device_no)?,
            ComputeDevice::Cuda => Device::new_cuda(device_no)?,
            ComputeDevice::Cpu => Device::Cpu,
        })
    }
}

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let ext = Path::new(input_file).extension().and_then(|x| x.to_str());
    let file = File::open(input_file)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", input_file, e))?;
    match ext {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a file for writing, and return a buffered writer
/// * `output_file` - file name--either gzipped or not
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }

    let ext = Path::new(output_file).extension().and_then(|x| x.to_str());
    let file = File::create(output_file)?;
    match ext {
        Some("gz") => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

///
/// Create a directory for the output file if needed
///
pub fn mkdir_parent(file: &str) -> anyhow::Result<()> {
    if let Some(dir) = Path::new(file).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    Ok(())
}

/// Read every non-empty line
pub fn read_lines(input_file: &str) -> anyhow::Result<Vec<Box<str>>> {
    let mut lines = vec![];
    for line in open_buf_reader(input_file)?.lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            lines.push(line.into());
        }
    }
    Ok(lines)
}

pub fn write_lines<T>(lines: &[T], output_file: &str) -> anyhow::Result<()>
where
    T: std::fmt::Display,
{
    let mut buf = open_buf_writer(output_file)?;
    for line in lines {
        writeln!(buf, "{}", line)?;
    }
    buf.flush()?;
    Ok(())
}

///
/// Read a dense numeric matrix, one row per line, values separated
/// by tabs, commas or spaces. Lines starting with `#` are skipped.
///
pub fn read_dense_matrix(input_file: &str) -> anyhow::Result<Array2<f32>> {
    let lines: Vec<String> = open_buf_reader(input_file)?
        .lines()
        .collect::<std::io::Result<Vec<_>>>()?;

    let rows = lines
        .par_iter()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| {
            line.split(|c: char| c == '\t' || c == ',' || c.is_whitespace())
                .filter(|w| !w.is_empty())
                .map(|w| {
                    w.parse::<f32>().map_err(|e| {
                        anyhow::anyhow!("{}:{}: cannot parse `{}`: {}", input_file, i + 1, w, e)
                    })
                })
                .collect::<anyhow::Result<Vec<f32>>>()
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let nrows = rows.len();
    let ncols = rows.first().map(|r| r.len()).unwrap_or(0);
    if nrows == 0 || ncols == 0 {
        return Err(anyhow::anyhow!("{} has no data", input_file));
    }
    if let Some(bad) = rows.iter().position(|r| r.len() != ncols) {
        return Err(anyhow::anyhow!(
            "{}: row {} has {} columns, expected {}",
            input_file,
            bad + 1,
            rows[bad].len(),
            ncols
        ));
    }

    Ok(Array2::from_shape_vec(
        (nrows, ncols),
        rows.into_iter().flatten().collect(),
    )?)
}

pub fn write_dense_matrix(mat: &Array2<f32>, output_file: &str) -> anyhow::Result<()> {
    let mut buf = open_buf_writer(output_file)?;
    for row in mat.rows() {
        let words: Vec<String> = row.iter().map(|x| x.to_string()).collect();
        writeln!(buf, "{}", words.join("\t"))?;
    }
    buf.flush()?;
    Ok(())
}

/// Write a rank 1 or rank 2 tensor, one row per line
pub fn write_tensor(tensor: &Tensor, output_file: &str) -> anyhow::Result<()> {
    let tensor = match tensor.rank() {
        1 => tensor.unsqueeze(1)?,
        2 => tensor.clone(),
        r => return Err(anyhow::anyhow!("cannot write a rank {} tensor", r)),
    };
    let (nrows, ncols) = tensor.dims2()?;
    let values = tensor
        .to_dtype(candle_core::DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    write_dense_matrix(&Array2::from_shape_vec((nrows, ncols), values)?, output_file)
}

/// Dense matrix as a candle tensor with the same shape
pub fn array_to_tensor(mat: &Array2<f32>, device: &Device) -> candle_core::Result<Tensor> {
    Tensor::from_iter(mat.iter().copied(), device)?.reshape(mat.dim())
}

/// Categorical labels mapped to dense indices in sorted name order
pub struct LabelIndex {
    pub names: Vec<Box<str>>,
    pub index: Vec<u32>,
}

impl LabelIndex {
    pub fn from_names(labels: &[Box<str>]) -> Self {
        let mut position: BTreeMap<&str, u32> = labels.iter().map(|l| (l.as_ref(), 0)).collect();
        for (k, v) in position.values_mut().enumerate() {
            *v = k as u32;
        }
        let index = labels.iter().map(|l| position[l.as_ref()]).collect();
        let names = position.keys().map(|&k| k.into()).collect();
        Self { names, index }
    }

    pub fn num_labels(&self) -> usize {
        self.names.len()
    }

    pub fn position(&self, name: &str) -> Option<u32> {
        self.names
            .iter()
            .position(|n| n.as_ref() == name)
            .map(|k| k as u32)
    }
}

pub fn read_labels(input_file: &str) -> anyhow::Result<LabelIndex> {
    Ok(LabelIndex::from_names(&read_lines(input_file)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_indexed_in_sorted_order() {
        let labels: Vec<Box<str>> = ["t", "b", "t", "nk", "b"].iter().map(|&s| s.into()).collect();
        let idx = LabelIndex::from_names(&labels);
        assert_eq!(idx.num_labels(), 3);
        assert_eq!(idx.names[0].as_ref(), "b");
        assert_eq!(idx.index, vec![2, 0, 2, 1, 0]);
        assert_eq!(idx.position("nk"), Some(1));
        assert_eq!(idx.position("dc"), None);
    }

    #[test]
    fn dense_matrix_round_trip_through_gzip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("x.tsv.gz");
        let file = file.to_str().ok_or_else(|| anyhow::anyhow!("path"))?;

        let mat = Array2::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as f32 * 0.5);
        write_dense_matrix(&mat, file)?;
        assert_eq!(read_dense_matrix(file)?, mat);
        Ok(())
    }

    #[test]
    fn ragged_rows_are_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("bad.tsv");
        std::fs::write(&file, "1\t2\t3\n4\t5\n")?;
        assert!(read_dense_matrix(file.to_str().unwrap()).is_err());
        Ok(())
    }
}
