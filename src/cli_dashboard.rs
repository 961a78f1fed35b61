//! Terminal dashboard over `GET /system_status`.
//!
//! Overview (workers and their current tasks)
//! Pending (head of the pending queue)
//! Failed (head of the failed queue)

use std::io::{self, Stdout};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use crossterm::event::{self, Event, KeyCode, KeyEvent};
use crossterm::execute;
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use taskmesh::client::ApiClient;
use taskmesh::status::{SystemStatus, TaskSummary, WorkerSummary};
use tui::backend::{Backend, CrosstermBackend};
use tui::layout::{Constraint, Direction, Layout, Rect};
use tui::style::{Color, Modifier, Style};
use tui::text::{Span, Spans};
use tui::widgets::{Block, Borders, List, ListItem, Paragraph, Tabs};
use tui::{Frame, Terminal};

const REFRESH: Duration = Duration::from_secs(2);
const INPUT_POLL: Duration = Duration::from_millis(250);
const TAB_TITLES: [&str; 3] = ["Overview", "Pending", "Failed"];

type Update = std::result::Result<SystemStatus, String>;

struct App {
  tab: usize,
  status: Option<SystemStatus>,
  last_error: Option<String>,
}

impl App {
  fn new() -> Self {
    Self { tab: 0, status: None, last_error: None }
  }

  /// Returns false once the user asked to quit.
  fn on_key(&mut self, key: KeyEvent) -> bool {
    match key.code {
      KeyCode::Char('q') | KeyCode::Esc => return false,
      KeyCode::Right | KeyCode::Tab => self.tab = (self.tab + 1) % TAB_TITLES.len(),
      KeyCode::Left | KeyCode::BackTab => self.tab = (self.tab + TAB_TITLES.len() - 1) % TAB_TITLES.len(),
      _ => {}
    }
    true
  }

  fn apply(&mut self, update: Update) {
    match update {
      Ok(status) => {
        self.status = Some(status);
        self.last_error = None;
      }
      Err(e) => self.last_error = Some(e),
    }
  }
}

/// Polls the API on its own thread and runtime so rendering never waits on the network.
fn spawn_poller(client: ApiClient) -> Receiver<Update> {
  let (tx, rx) = mpsc::channel();
  thread::spawn(move || {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
      Ok(runtime) => runtime,
      Err(e) => {
        let _ = tx.send(Err(format!("failed to start runtime: {e}")));
        return;
      }
    };
    loop {
      let update = runtime.block_on(client.system_status()).map_err(|e| format!("{e:#}"));
      if tx.send(update).is_err() {
        return;
      }
      thread::sleep(REFRESH);
    }
  });
  rx
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
  terminal::enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen)?;
  Ok(Terminal::new(CrosstermBackend::new(stdout))?)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
  terminal::disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
  terminal.show_cursor()?;
  Ok(())
}

fn main() -> Result<()> {
  let api_url = std::env::var("API_URL").unwrap_or_else(|_| "http://127.0.0.1:5000".into());
  let updates = spawn_poller(ApiClient::new(&api_url));

  let mut terminal = setup_terminal()?;
  let result = run(&mut terminal, &updates, &api_url);
  restore_terminal(&mut terminal)?;
  result
}

fn run<B: Backend>(terminal: &mut Terminal<B>, updates: &Receiver<Update>, api_url: &str) -> Result<()> {
  let mut app = App::new();
  loop {
    for update in updates.try_iter() {
      app.apply(update);
    }
    terminal.draw(|f| draw(f, &app, api_url))?;

    if event::poll(INPUT_POLL)? {
      if let Event::Key(key) = event::read()? {
        if !app.on_key(key) {
          return Ok(());
        }
      }
    }
  }
}

fn draw<B: Backend>(f: &mut Frame<B>, app: &App, api_url: &str) {
  let rows = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)].as_ref())
    .split(f.size());

  let titles = TAB_TITLES.iter().map(|t| Spans::from(*t)).collect();
  let tabs = Tabs::new(titles)
    .block(Block::default().borders(Borders::ALL).title(format!("taskmesh @ {api_url}")))
    .style(Style::default().fg(Color::Yellow))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(app.tab);
  f.render_widget(tabs, rows[0]);

  match &app.status {
    None => f.render_widget(
      Paragraph::new("Waiting for first status snapshot...").block(Block::default().borders(Borders::ALL)),
      rows[1],
    ),
    Some(status) => match app.tab {
      0 => draw_overview(f, status, rows[1]),
      1 => draw_tasks(f, &status.tasks, format!("Pending ({})", status.pending_count), Color::Yellow, rows[1]),
      _ => draw_tasks(f, &status.failed_tasks, format!("Failed ({})", status.failed_count), Color::Red, rows[1]),
    },
  }

  let (footer, color) = match &app.last_error {
    Some(e) => (format!("API error: {e}"), Color::Red),
    None => ("←/→ switch tabs, q quits".to_string(), Color::Gray),
  };
  f.render_widget(
    Paragraph::new(footer).style(Style::default().fg(color)).block(Block::default().borders(Borders::ALL)),
    rows[2],
  );
}

fn draw_overview<B: Backend>(f: &mut Frame<B>, status: &SystemStatus, area: Rect) {
  let columns = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(65), Constraint::Percentage(35)].as_ref())
    .split(area);

  let workers: Vec<ListItem> = status.workers.iter().map(worker_item).collect();
  let title = format!("Workers ({} alive)", status.workers.iter().filter(|w| w.alive).count());
  f.render_widget(List::new(workers).block(Block::default().borders(Borders::ALL).title(title)), columns[0]);

  let counts: Vec<ListItem> = [
    ("pending", status.pending_count),
    ("processing", status.processing_count),
    ("failed", status.failed_count),
  ]
  .iter()
  .map(|(name, count)| ListItem::new(format!("{name:<11}{count:>6}")))
  .collect();
  f.render_widget(List::new(counts).block(Block::default().borders(Borders::ALL).title("Queues")), columns[1]);
}

fn worker_item(worker: &WorkerSummary) -> ListItem<'static> {
  let color = if worker.alive { Color::Green } else { Color::Red };
  let task = worker.current_task_id.as_deref().unwrap_or("-");
  ListItem::new(vec![
    Spans::from(Span::styled(worker.worker_id.clone(), Style::default().fg(color).add_modifier(Modifier::BOLD))),
    Spans::from(format!("  {} | task {} | seen {}", worker.status, task, format_epoch(worker.last_heartbeat))),
  ])
}

fn draw_tasks<B: Backend>(f: &mut Frame<B>, tasks: &[TaskSummary], title: String, color: Color, area: Rect) {
  let items: Vec<ListItem> = tasks
    .iter()
    .map(|task| {
      ListItem::new(Spans::from(vec![
        Span::styled(format!("{:<10}", task.id), Style::default().fg(color).add_modifier(Modifier::BOLD)),
        Span::raw(task.payload.clone()),
      ]))
    })
    .collect();
  f.render_widget(List::new(items).block(Block::default().borders(Borders::ALL).title(title)), area);
}

fn format_epoch(epoch: f64) -> String {
  DateTime::<Utc>::from_timestamp_micros((epoch * 1_000_000.0) as i64)
    .map(|at| at.format("%H:%M:%S").to_string())
    .unwrap_or_else(|| "N/A".into())
}
