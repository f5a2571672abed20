//! 表格清单. 每行一个 subject, 每列是 subject id, 影像路径或标量预测目标.
//!
//! 清单由外部的划分工具生成; 这里只负责持有和按位置访问.

use std::io::Read;
use std::path::Path;

use crate::config::Headers;
use crate::error::{ConfigError, Result};

/// 表格清单.
#[derive(Clone, Debug, Default)]
pub struct Manifest {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Manifest {
    /// 由列名和行数据直接创建. 长度不足的行会以空字符串补齐.
    pub fn new<C, R, I, S>(columns: C, rows: R) -> Self
    where
        C: IntoIterator<Item = S>,
        R: IntoIterator<Item = I>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let rows = rows
            .into_iter()
            .map(|r| {
                let mut row: Vec<String> = r.into_iter().map(Into::into).collect();
                if row.len() < columns.len() {
                    row.resize(columns.len(), String::new());
                }
                row
            })
            .collect();
        Self { columns, rows }
    }

    /// 读取带表头的 CSV 清单.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let columns: Vec<String> = rdr.headers()?.iter().map(str::to_owned).collect();
        let mut rows = Vec::new();
        for record in rdr.records() {
            rows.push(record?.iter().map(str::to_owned).collect::<Vec<_>>());
        }
        Ok(Self::new(columns, rows))
    }

    /// 读取本地 CSV 清单文件.
    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// 列名.
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// 行数.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// 清单是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 列数.
    #[inline]
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// 获取第 `row` 行第 `col` 列的单元格. 越界时返回 `None`.
    #[inline]
    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col).map(String::as_str)
    }

    /// 按行迭代.
    pub fn rows(&self) -> impl ExactSizeIterator<Item = Row<'_>> {
        self.rows.iter().map(|cells| Row { cells })
    }

    /// 检查 `headers` 引用的列都在清单范围内.
    pub fn check_headers(&self, headers: &Headers) -> std::result::Result<(), ConfigError> {
        let len = self.width();
        match headers.columns().find(|i| *i >= len) {
            Some(index) => Err(ConfigError::ColumnOutOfRange { index, len }),
            None => Ok(()),
        }
    }
}

/// 清单中的一行.
#[derive(Copy, Clone, Debug)]
pub struct Row<'a> {
    cells: &'a [String],
}

impl<'a> Row<'a> {
    /// 第 `col` 列的单元格. 越界时返回空字符串.
    #[inline]
    pub fn get(&self, col: usize) -> &'a str {
        self.cells.get(col).map_or("", String::as_str)
    }
}
