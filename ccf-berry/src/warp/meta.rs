//! MetaImage (`.mhd`) 文本 header 的最小解析.
//!
//! 配准产物中的位移场以 "文本 header + 裸数据" 文件对的形式交付.
//! 这里只认识该 pipeline 实际会遇到的字段.

use super::LoadFieldError;

/// 已解析的 `.mhd` header.
#[derive(Debug, Clone)]
pub struct MetaHeader {
    /// 空间维数. 位移场要求为 3.
    pub ndims: u32,

    /// 各维体素个数, 按 header 原始顺序 \[x, y, z\].
    pub dim_size: Vec<usize>,

    /// 各维体素间距, 按 \[x, y, z\], 单位为微米.
    pub spacing: Vec<f64>,

    /// 体数据原点的物理坐标, 按 \[x, y, z\], 单位为微米. 缺省为 0.
    pub offset: Vec<f64>,

    /// 每个体素的通道数. 位移场要求为 3.
    pub channels: u32,

    /// 元素类型字符串, 如 `MET_FLOAT`.
    pub element_type: String,

    /// 裸数据文件名, 相对于 header 所在目录.
    pub data_file: String,
}

/// 解析 `key = value` 形式的一行. 返回 (key, value), 两侧空白被去除.
fn split_kv(line: &str) -> Option<(&str, &str)> {
    let (k, v) = line.split_once('=')?;
    Some((k.trim(), v.trim()))
}

/// 将空白分隔的数字序列解析为 `Vec<T>`.
fn parse_seq<T: std::str::FromStr>(key: &str, v: &str) -> Result<Vec<T>, LoadFieldError> {
    v.split_whitespace()
        .map(|tok| {
            tok.parse::<T>()
                .map_err(|_| LoadFieldError::BadHeader(format!("字段 {key} 含非法数字 `{tok}`")))
        })
        .collect()
}

impl MetaHeader {
    /// 从 header 文本解析. 未知字段被忽略, 必要字段缺失返回 `Err`.
    pub fn parse(text: &str) -> Result<Self, LoadFieldError> {
        let mut ndims = None;
        let mut dim_size = None;
        let mut spacing = None;
        let mut offset = None;
        let mut channels = 1u32;
        let mut element_type = None;
        let mut data_file = None;

        for line in text.lines() {
            let Some((key, value)) = split_kv(line) else {
                continue;
            };
            match key {
                "NDims" => {
                    ndims = Some(value.parse::<u32>().map_err(|_| {
                        LoadFieldError::BadHeader(format!("NDims 非法: `{value}`"))
                    })?)
                }
                "DimSize" => dim_size = Some(parse_seq::<usize>(key, value)?),
                "ElementSpacing" => spacing = Some(parse_seq::<f64>(key, value)?),
                "Offset" => offset = Some(parse_seq::<f64>(key, value)?),
                "ElementNumberOfChannels" => {
                    channels = value.parse::<u32>().map_err(|_| {
                        LoadFieldError::BadHeader(format!(
                            "ElementNumberOfChannels 非法: `{value}`"
                        ))
                    })?
                }
                "ElementType" => element_type = Some(value.to_owned()),
                "ElementDataFile" => data_file = Some(value.to_owned()),
                _ => {}
            }
        }

        let require = |name: &str| LoadFieldError::BadHeader(format!("缺少字段 {name}"));
        let ndims = ndims.ok_or_else(|| require("NDims"))?;
        let dim_size = dim_size.ok_or_else(|| require("DimSize"))?;
        let spacing = spacing.ok_or_else(|| require("ElementSpacing"))?;
        let element_type = element_type.ok_or_else(|| require("ElementType"))?;
        let data_file = data_file.ok_or_else(|| require("ElementDataFile"))?;
        let offset = offset.unwrap_or_else(|| vec![0.0; ndims as usize]);

        if dim_size.len() != ndims as usize
            || spacing.len() != ndims as usize
            || offset.len() != ndims as usize
        {
            return Err(LoadFieldError::BadHeader(format!(
                "DimSize/ElementSpacing/Offset 长度与 NDims = {ndims} 不一致"
            )));
        }
        if dim_size.iter().any(|&d| d == 0) {
            return Err(LoadFieldError::BadHeader("DimSize 含 0".to_owned()));
        }
        if data_file == "LOCAL" {
            // 内嵌数据模式不在该 pipeline 的交付约定内.
            return Err(LoadFieldError::BadHeader(
                "不支持 ElementDataFile = LOCAL".to_owned(),
            ));
        }

        Ok(Self {
            ndims,
            dim_size,
            spacing,
            offset,
            channels,
            element_type,
            data_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "ObjectType = Image\n\
        NDims = 3\n\
        BinaryData = True\n\
        BinaryDataByteOrderMSB = False\n\
        DimSize = 4 5 6\n\
        ElementSpacing = 25 25 25\n\
        Offset = 0 0 0\n\
        ElementNumberOfChannels = 3\n\
        ElementType = MET_FLOAT\n\
        ElementDataFile = displacement.raw\n";

    #[test]
    fn test_parse_full_header() {
        let h = MetaHeader::parse(HEADER).unwrap();
        assert_eq!(h.ndims, 3);
        assert_eq!(h.dim_size, vec![4, 5, 6]);
        assert_eq!(h.spacing, vec![25.0, 25.0, 25.0]);
        assert_eq!(h.offset, vec![0.0, 0.0, 0.0]);
        assert_eq!(h.channels, 3);
        assert_eq!(h.element_type, "MET_FLOAT");
        assert_eq!(h.data_file, "displacement.raw");
    }

    #[test]
    fn test_missing_field_is_err() {
        let text = "NDims = 3\nDimSize = 1 1 1\n";
        assert!(matches!(
            MetaHeader::parse(text),
            Err(LoadFieldError::BadHeader(_))
        ));
    }

    #[test]
    fn test_dim_mismatch_is_err() {
        let text = "NDims = 3\nDimSize = 1 1\nElementSpacing = 1 1 1\n\
            ElementType = MET_FLOAT\nElementDataFile = f.raw\n";
        assert!(matches!(
            MetaHeader::parse(text),
            Err(LoadFieldError::BadHeader(_))
        ));
    }

    #[test]
    fn test_local_data_rejected() {
        let text = "NDims = 3\nDimSize = 1 1 1\nElementSpacing = 1 1 1\n\
            ElementType = MET_FLOAT\nElementDataFile = LOCAL\n";
        assert!(matches!(
            MetaHeader::parse(text),
            Err(LoadFieldError::BadHeader(_))
        ));
    }
}
