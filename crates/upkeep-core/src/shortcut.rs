use serde::{Deserialize, Serialize};

use crate::tlv::{read_fields, FieldReader, FieldWriter, TlvRecord, TlvResult};

const TAG_TARGET: u8 = 0x01;
const TAG_WORKING_DIRECTORY: u8 = 0x02;
const TAG_ARGUMENTS: u8 = 0x03;
const TAG_DESCRIPTION: u8 = 0x04;
const TAG_ICON_PATH: u8 = 0x05;
const TAG_ICON_INDEX: u8 = 0x06;
const TAG_WINDOW_STYLE: u8 = 0x07;
const TAG_RELATIVE_OUTPUT: u8 = 0x08;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortcutRecord {
    pub target_path: Option<String>,
    pub working_directory: Option<String>,
    pub arguments: Option<String>,
    pub description: Option<String>,
    pub icon_path: Option<String>,
    pub icon_index: Option<i32>,
    pub window_style: Option<i32>,
    pub relative_output_path: Option<String>,
}

impl TlvRecord for ShortcutRecord {
    const START: u8 = 0x8D;
    const END: u8 = 0x9A;

    fn write_fields(&self, out: &mut FieldWriter) {
        out.opt_string(TAG_TARGET, self.target_path.as_deref());
        out.opt_string(TAG_WORKING_DIRECTORY, self.working_directory.as_deref());
        out.opt_string(TAG_ARGUMENTS, self.arguments.as_deref());
        out.opt_string(TAG_DESCRIPTION, self.description.as_deref());
        out.opt_string(TAG_ICON_PATH, self.icon_path.as_deref());
        out.opt_i32(TAG_ICON_INDEX, self.icon_index);
        out.opt_i32(TAG_WINDOW_STYLE, self.window_style);
        out.opt_string(TAG_RELATIVE_OUTPUT, self.relative_output_path.as_deref());
    }

    fn read_body(reader: &mut FieldReader<'_>) -> TlvResult<Self> {
        let mut record = Self::default();
        read_fields(reader, Self::END, |tag, r| {
            match tag {
                TAG_TARGET => record.target_path = Some(r.read_string()?),
                TAG_WORKING_DIRECTORY => record.working_directory = Some(r.read_string()?),
                TAG_ARGUMENTS => record.arguments = Some(r.read_string()?),
                TAG_DESCRIPTION => record.description = Some(r.read_string()?),
                TAG_ICON_PATH => record.icon_path = Some(r.read_string()?),
                TAG_ICON_INDEX => record.icon_index = Some(r.read_i32()?),
                TAG_WINDOW_STYLE => record.window_style = Some(r.read_i32()?),
                TAG_RELATIVE_OUTPUT => record.relative_output_path = Some(r.read_string()?),
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(record)
    }
}
