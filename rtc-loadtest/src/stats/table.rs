use std::io::{self, Write};

/// Table renders rows of cells with aligned columns.
#[derive(Debug, Default, Clone)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    footer: Option<Vec<String>>,
}

impl Table {
    pub fn new<S: AsRef<str>>(headers: &[S]) -> Self {
        Table {
            headers: headers.iter().map(|h| h.as_ref().to_owned()).collect(),
            ..Default::default()
        }
    }

    pub fn add_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    /// A row set apart below the body, e.g. totals.
    pub fn set_footer(&mut self, footer: Vec<String>) {
        self.footer = Some(footer);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in self.rows.iter().chain(self.footer.iter()) {
            for (i, cell) in row.iter().enumerate() {
                let len = cell.chars().count();
                match widths.get_mut(i) {
                    Some(width) => *width = (*width).max(len),
                    None => widths.push(len),
                }
            }
        }
        widths
    }

    pub fn render<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        let widths = self.widths();
        let border = widths
            .iter()
            .map(|width| "-".repeat(width + 2))
            .collect::<Vec<_>>()
            .join("+");
        let border = format!("+{border}+");

        writeln!(w, "{border}")?;
        write_row(w, &self.headers, &widths)?;
        writeln!(w, "{border}")?;
        for row in &self.rows {
            write_row(w, row, &widths)?;
        }
        if let Some(footer) = &self.footer {
            writeln!(w, "{border}")?;
            write_row(w, footer, &widths)?;
        }
        writeln!(w, "{border}")
    }
}

fn write_row<W: Write + ?Sized>(w: &mut W, row: &[String], widths: &[usize]) -> io::Result<()> {
    let cells = widths
        .iter()
        .enumerate()
        .map(|(i, width)| {
            let cell = row.get(i).map(String::as_str).unwrap_or("");
            let pad = width.saturating_sub(cell.chars().count());
            format!(" {cell}{} ", " ".repeat(pad))
        })
        .collect::<Vec<_>>()
        .join("|");
    writeln!(w, "|{cells}|")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_render_aligns_columns() {
        let mut table = Table::new(&["Tester", "Tracks"]);
        table.add_row(vec!["Sub 0".to_owned(), "5/5".to_owned()]);
        table.add_row(vec!["Sub 10".to_owned(), "12/16".to_owned()]);
        table.set_footer(vec!["Total".to_owned(), "17/21".to_owned()]);

        let mut out = vec![];
        table.render(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines[0], "+--------+--------+");
        assert_eq!(lines[1], "| Tester | Tracks |");
        assert_eq!(lines[3], "| Sub 0  | 5/5    |");
        assert_eq!(lines[4], "| Sub 10 | 12/16  |");
        assert_eq!(lines[6], "| Total  | 17/21  |");
        assert_eq!(lines.len(), 8);
        assert_eq!(table.len(), 2);
    }
}
