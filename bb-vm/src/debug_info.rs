#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub offset: u32,
    pub line: u32,
    pub column: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgInfo {
    pub name: String,
    pub position: usize,
}

/// A function's instruction range, `start..end`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: String,
    pub start: u32,
    pub end: u32,
    pub args: Vec<ArgInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DebugInfo {
    pub source: Option<String>,
    pub locations: Vec<SourceLocation>,
    pub functions: Vec<FunctionInfo>,
}

impl DebugInfo {
    /// Nearest location at or before `offset`. Locations are sorted by offset.
    pub fn location_for(&self, offset: usize) -> Option<&SourceLocation> {
        let offset = offset as u32;
        let index = self
            .locations
            .partition_point(|location| location.offset <= offset);
        index.checked_sub(1).map(|index| &self.locations[index])
    }

    pub fn line_for_offset(&self, offset: usize) -> Option<u32> {
        self.location_for(offset).map(|location| location.line)
    }

    pub fn offsets_for_line(&self, line: u32) -> Vec<u32> {
        self.locations
            .iter()
            .filter(|location| location.line == line)
            .map(|location| location.offset)
            .collect()
    }

    pub fn function_for(&self, offset: usize) -> Option<&FunctionInfo> {
        let offset = offset as u32;
        self.functions
            .iter()
            .find(|function| function.start <= offset && offset < function.end)
    }

    pub fn source_line(&self, line: u32) -> Option<String> {
        let source = self.source.as_ref()?;
        let index = line.checked_sub(1)? as usize;
        source.lines().nth(index).map(|text| text.to_string())
    }
}

#[derive(Default)]
pub struct DebugInfoBuilder {
    source: Option<String>,
    locations: Vec<SourceLocation>,
    functions: Vec<FunctionInfo>,
    open_function: Option<FunctionInfo>,
}

impl DebugInfoBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_source(&mut self, source: String) {
        self.source = Some(source);
    }

    /// Later marks for the same offset replace earlier ones.
    pub fn mark_location(&mut self, offset: u32, line: u32, column: u32) {
        if let Some(last) = self.locations.last_mut()
            && last.offset == offset
        {
            last.line = line;
            last.column = column;
            return;
        }
        self.locations.push(SourceLocation {
            offset,
            line,
            column,
        });
    }

    pub fn mark_line(&mut self, offset: u32, line: u32) {
        self.mark_location(offset, line, 1);
    }

    /// Opens a function at `start`, closing any function still open there.
    pub fn begin_function(&mut self, name: String, start: u32, args: Vec<String>) {
        self.end_function(start);
        let args = args
            .into_iter()
            .enumerate()
            .map(|(idx, name)| ArgInfo { name, position: idx })
            .collect();
        self.open_function = Some(FunctionInfo {
            name,
            start,
            end: start,
            args,
        });
    }

    pub fn end_function(&mut self, end: u32) {
        if let Some(mut function) = self.open_function.take() {
            function.end = end;
            self.functions.push(function);
        }
    }

    pub fn finish(mut self, code_len: u32) -> Option<DebugInfo> {
        self.end_function(code_len);
        if self.source.is_none() && self.locations.is_empty() && self.functions.is_empty() {
            return None;
        }
        self.locations.sort_by_key(|location| location.offset);
        Some(DebugInfo {
            source: self.source,
            locations: self.locations,
            functions: self.functions,
        })
    }
}
