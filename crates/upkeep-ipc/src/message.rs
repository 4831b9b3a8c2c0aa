use upkeep_core::tlv::{read_fields, CorruptDataError, FieldReader, FieldWriter, TlvRecord, TlvResult};

const TAG_ACTION: u8 = 0x01;
const TAG_STEP: u8 = 0x02;
const TAG_EXTRA_STRING: u8 = 0x03;
const TAG_PROCESS_ID: u8 = 0x04;
const TAG_PROGRESS: u8 = 0x05;
const TAG_RESPONSE: u8 = 0x06;
const TAG_LINK_START: u8 = 0x07;
const TAG_LINK_LENGTH: u8 = 0x08;
const TAG_LINK_TARGET: u8 = 0x09;
const TAG_RICH_TEXT: u8 = 0x80;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IpcAction {
    #[default]
    UpdateStep,
    GetProcessId,
    Cancel,
    /// Sent by a freshly launched updater; the receiving server relays for it.
    NewProcess,
}

impl IpcAction {
    pub fn code(self) -> i32 {
        match self {
            Self::UpdateStep => 0,
            Self::GetProcessId => 1,
            Self::Cancel => 2,
            Self::NewProcess => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::UpdateStep),
            1 => Some(Self::GetProcessId),
            2 => Some(Self::Cancel),
            3 => Some(Self::NewProcess),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UpdateStep {
    #[default]
    CheckForUpdate,
    DownloadUpdate,
    BeginExtraction,
    RestartInfo,
    Install,
    ForceRecheck,
}

impl UpdateStep {
    pub fn code(self) -> i32 {
        match self {
            Self::CheckForUpdate => 0,
            Self::DownloadUpdate => 1,
            Self::BeginExtraction => 2,
            Self::RestartInfo => 3,
            Self::Install => 4,
            Self::ForceRecheck => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::CheckForUpdate),
            1 => Some(Self::DownloadUpdate),
            2 => Some(Self::BeginExtraction),
            3 => Some(Self::RestartInfo),
            4 => Some(Self::Install),
            5 => Some(Self::ForceRecheck),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    #[default]
    None,
    Progress,
    Succeeded,
    Failed,
}

impl ResponseKind {
    pub fn code(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Progress => 1,
            Self::Succeeded => 2,
            Self::Failed => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Progress),
            2 => Some(Self::Succeeded),
            3 => Some(Self::Failed),
            _ => None,
        }
    }
}

fn out_of_range(what: &str, value: i32) -> CorruptDataError {
    CorruptDataError::malformed(format!("{what} value {value} is out of range"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraString {
    pub text: String,
    pub rich: bool,
}

impl ExtraString {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            rich: false,
        }
    }

    pub fn rich(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            rich: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSpan {
    pub start: i32,
    pub length: i32,
    pub target: String,
}

/// One request, reply or notification exchanged over the pipe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpcMessage {
    pub action: IpcAction,
    pub step: UpdateStep,
    pub response: ResponseKind,
    pub progress: Option<u8>,
    pub extra_strings: Vec<ExtraString>,
    pub link_spans: Vec<LinkSpan>,
    pub process_id: Option<u32>,
}

impl IpcMessage {
    pub fn update_step(step: UpdateStep) -> Self {
        Self {
            step,
            ..Self::default()
        }
    }

    pub fn action(action: IpcAction) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }

    /// Reply to `GetProcessID` carrying this process's id.
    pub fn process_id_reply() -> Self {
        Self {
            action: IpcAction::GetProcessId,
            process_id: Some(std::process::id()),
            ..Self::default()
        }
    }

    pub fn progress(step: UpdateStep, percent: u8, status: impl Into<String>) -> Self {
        Self {
            step,
            response: ResponseKind::Progress,
            progress: Some(percent.min(100)),
            extra_strings: vec![ExtraString::plain(status)],
            ..Self::default()
        }
    }

    pub fn succeeded(step: UpdateStep) -> Self {
        Self {
            step,
            response: ResponseKind::Succeeded,
            ..Self::default()
        }
    }

    pub fn failed(step: UpdateStep, title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            step,
            response: ResponseKind::Failed,
            extra_strings: vec![ExtraString::plain(title), ExtraString::plain(detail)],
            ..Self::default()
        }
    }

    /// Answer to a `NewProcess` announcement the server refused because another peer relays.
    pub fn relay_rejected(detail: impl Into<String>) -> Self {
        Self {
            action: IpcAction::NewProcess,
            ..Self::failed(UpdateStep::Install, "Relay rejected", detail)
        }
    }

    pub fn is_relay_rejection(&self) -> bool {
        self.action == IpcAction::NewProcess && self.response == ResponseKind::Failed
    }

    pub fn with_string(mut self, text: ExtraString) -> Self {
        self.extra_strings.push(text);
        self
    }

    pub fn with_link(mut self, span: LinkSpan) -> Self {
        self.link_spans.push(span);
        self
    }

    pub fn first_string(&self) -> Option<&str> {
        self.extra_strings.first().map(|s| s.text.as_str())
    }
}

impl TlvRecord for IpcMessage {
    const START: u8 = 0x8A;
    const END: u8 = 0xFF;

    fn write_fields(&self, out: &mut FieldWriter) {
        out.i32(TAG_ACTION, self.action.code());
        out.i32(TAG_STEP, self.step.code());
        for extra in &self.extra_strings {
            if extra.rich {
                out.flag(TAG_RICH_TEXT);
            }
            out.string(TAG_EXTRA_STRING, &extra.text);
        }
        if let Some(pid) = self.process_id {
            out.i32(TAG_PROCESS_ID, pid as i32);
        }
        if let Some(progress) = self.progress {
            out.i32(TAG_PROGRESS, i32::from(progress));
        }
        if self.response != ResponseKind::None {
            out.i32(TAG_RESPONSE, self.response.code());
        }
        for span in &self.link_spans {
            out.i32(TAG_LINK_START, span.start);
            out.i32(TAG_LINK_LENGTH, span.length);
            out.string(TAG_LINK_TARGET, &span.target);
        }
    }

    fn read_body(reader: &mut FieldReader<'_>) -> TlvResult<Self> {
        let mut message = Self::default();
        let mut rich_pending = false;
        read_fields(reader, Self::END, |tag, r| {
            match tag {
                TAG_ACTION => {
                    let code = r.read_i32()?;
                    message.action =
                        IpcAction::from_code(code).ok_or_else(|| out_of_range("ipc action", code))?;
                }
                TAG_STEP => {
                    let code = r.read_i32()?;
                    message.step =
                        UpdateStep::from_code(code).ok_or_else(|| out_of_range("update step", code))?;
                }
                TAG_RICH_TEXT => {
                    r.read_flag()?;
                    rich_pending = true;
                }
                TAG_EXTRA_STRING => {
                    message.extra_strings.push(ExtraString {
                        text: r.read_string()?,
                        rich: std::mem::take(&mut rich_pending),
                    });
                }
                TAG_PROCESS_ID => message.process_id = Some(r.read_i32()? as u32),
                TAG_PROGRESS => {
                    let percent = r.read_i32()?;
                    let percent = u8::try_from(percent)
                        .ok()
                        .filter(|percent| *percent <= 100)
                        .ok_or_else(|| {
                            CorruptDataError::malformed(format!(
                                "progress {percent} is outside 0..=100"
                            ))
                        })?;
                    message.progress = Some(percent);
                }
                TAG_RESPONSE => {
                    let code = r.read_i32()?;
                    message.response = ResponseKind::from_code(code)
                        .ok_or_else(|| out_of_range("response type", code))?;
                }
                TAG_LINK_START => message.link_spans.push(LinkSpan {
                    start: r.read_i32()?,
                    ..LinkSpan::default()
                }),
                TAG_LINK_LENGTH => current_span(&mut message.link_spans)?.length = r.read_i32()?,
                TAG_LINK_TARGET => current_span(&mut message.link_spans)?.target = r.read_string()?,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(message)
    }
}

fn current_span(spans: &mut [LinkSpan]) -> TlvResult<&mut LinkSpan> {
    spans
        .last_mut()
        .ok_or_else(|| CorruptDataError::malformed("link span field before its start field"))
}
