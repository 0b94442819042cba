use anyhow::Result;
use chrono::{Local, NaiveDate};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Tabs, Wrap},
    Frame, Terminal,
};
use std::io;
use tokio::runtime::Runtime;

use crate::config::{self, KNOWN_KEYS};
use crate::console::{Console, ConsoleResult, Inventory, Level, Notice, Outcome};
use crate::models::{
    Category, DashboardSummary, Member, Product, ProductPatch, Task, TaskPatch, TaskStatus,
};
use crate::outbox;
use crate::rules;

const TAB_TITLES: [&str; 5] = ["Dashboard", "Tasks", "Members", "Inventory", "Config"];
const TAB_DASHBOARD: usize = 0;
const TAB_TASKS: usize = 1;
const TAB_MEMBERS: usize = 2;
const TAB_INVENTORY: usize = 3;
const TAB_CONFIG: usize = 4;

/// A storage call triggered from the UI; run while the busy line is shown.
#[derive(Debug, Clone)]
enum Action {
    Refresh,
    CreateTask {
        title: String,
        assignee: String,
        due_date: NaiveDate,
        description: Option<String>,
    },
    CompleteTask(String),
    EditTask { id: String, patch: TaskPatch },
    DeleteTask(String),
    AddMember(String),
    RenameMember { id: String, name: String },
    DeleteMember(String),
    AddProduct {
        name: String,
        stock: i64,
        threshold: i64,
        category_id: Option<String>,
    },
    Outbound { id: String, quantity: i64 },
    Inbound { id: String, quantity: i64 },
    EditProduct { id: String, patch: ProductPatch },
    MoveProduct { id: String, category_id: String },
    DeleteProduct(String),
    AddCategory(String),
    RenameCategory { id: String, name: String },
    DeleteCategory(String),
    SetConfig { key: String, value: String },
}

#[derive(Debug, Clone)]
enum FormKind {
    NewTask,
    EditTask(String),
    NewMember,
    RenameMember(String),
    NewProduct(Option<String>),
    EditProduct(String),
    NewCategory,
    RenameCategory(String),
    Outbound(String),
    Inbound(String),
    ConfigEdit(String),
}

#[derive(Debug, Clone)]
struct Field {
    label: &'static str,
    value: String,
}

#[derive(Debug, Clone)]
struct Form {
    title: String,
    kind: FormKind,
    fields: Vec<Field>,
    focus: usize,
}

impl Form {
    fn new(title: impl Into<String>, kind: FormKind, fields: &[(&'static str, &str)]) -> Self {
        Form {
            title: title.into(),
            kind,
            fields: fields
                .iter()
                .map(|&(label, value)| Field {
                    label,
                    value: value.to_string(),
                })
                .collect(),
            focus: 0,
        }
    }

    fn value(&self, index: usize) -> &str {
        self.fields.get(index).map(|f| f.value.trim()).unwrap_or("")
    }

    fn focused_mut(&mut self) -> Option<&mut Field> {
        self.fields.get_mut(self.focus)
    }

    fn next_field(&mut self) {
        self.focus = (self.focus + 1) % self.fields.len().max(1);
    }

    fn previous_field(&mut self) {
        let len = self.fields.len().max(1);
        self.focus = (self.focus + len - 1) % len;
    }

    /// Turns the filled form into an action, or says which field is wrong.
    fn to_action(&self) -> Result<Action, String> {
        let number = |index: usize| -> Result<i64, String> {
            self.value(index)
                .parse::<i64>()
                .map_err(|_| format!("{} must be a whole number", self.fields[index].label))
        };
        let action = match &self.kind {
            FormKind::NewTask => {
                let due_date = NaiveDate::parse_from_str(self.value(2), "%Y-%m-%d")
                    .map_err(|_| "Due date must look like 2024-06-01".to_string())?;
                let description = Some(self.value(3).to_string()).filter(|d| !d.is_empty());
                Action::CreateTask {
                    title: self.value(0).to_string(),
                    assignee: self.value(1).to_string(),
                    due_date,
                    description,
                }
            }
            FormKind::EditTask(id) => {
                let due_date = NaiveDate::parse_from_str(self.value(2), "%Y-%m-%d")
                    .map_err(|_| "Due date must look like 2024-06-01".to_string())?;
                // An empty description clears it.
                Action::EditTask {
                    id: id.clone(),
                    patch: TaskPatch {
                        title: Some(self.value(0).to_string()),
                        assignee: Some(self.value(1).to_string()),
                        due_date: Some(due_date),
                        description: Some(self.value(3).to_string()),
                        status: None,
                    },
                }
            }
            FormKind::NewMember => Action::AddMember(self.value(0).to_string()),
            FormKind::RenameMember(id) => Action::RenameMember {
                id: id.clone(),
                name: self.value(0).to_string(),
            },
            FormKind::NewProduct(category_id) => Action::AddProduct {
                name: self.value(0).to_string(),
                stock: number(1)?,
                threshold: number(2)?,
                category_id: category_id.clone(),
            },
            FormKind::EditProduct(id) => Action::EditProduct {
                id: id.clone(),
                patch: ProductPatch {
                    name: Some(self.value(0).to_string()),
                    stock: Some(number(1)?),
                    threshold: Some(number(2)?),
                    category_id: None,
                },
            },
            FormKind::NewCategory => Action::AddCategory(self.value(0).to_string()),
            FormKind::RenameCategory(id) => Action::RenameCategory {
                id: id.clone(),
                name: self.value(0).to_string(),
            },
            FormKind::Outbound(id) => Action::Outbound {
                id: id.clone(),
                quantity: number(0)?,
            },
            FormKind::Inbound(id) => Action::Inbound {
                id: id.clone(),
                quantity: number(0)?,
            },
            FormKind::ConfigEdit(key) => {
                config::validate_value(key, self.value(0))?;
                Action::SetConfig {
                    key: key.clone(),
                    value: self.value(0).to_string(),
                }
            }
        };
        Ok(action)
    }
}

enum Popup {
    None,
    Form(Form),
    ChooseCategory { product_id: String, state: ListState },
    Confirm { prompt: String, action: Action },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InventoryFocus {
    Categories,
    Products,
}

pub struct App<'a> {
    console: Console,
    rt: &'a Runtime,
    pub current_tab: usize,
    pub summary: DashboardSummary,
    pub tasks: Vec<Task>,
    pub members: Vec<Member>,
    pub inventory: Inventory,
    pub configs: Vec<(String, Option<String>)>,
    pub outbox_len: usize,
    pub task_list_state: ListState,
    pub member_list_state: ListState,
    pub category_list_state: ListState,
    pub product_list_state: ListState,
    pub config_list_state: ListState,
    inventory_focus: InventoryFocus,
    popup: Popup,
    pub notices: Vec<Notice>,
    pub busy: bool,
    pub should_quit: bool,
}

fn step(state: &mut ListState, len: usize, forward: bool) {
    if len == 0 {
        state.select(None);
        return;
    }
    let i = match state.selected() {
        Some(i) if forward => {
            if i >= len - 1 {
                0
            } else {
                i + 1
            }
        }
        Some(i) => {
            if i == 0 {
                len - 1
            } else {
                i - 1
            }
        }
        None => 0,
    };
    state.select(Some(i));
}

fn clamp(state: &mut ListState, len: usize) {
    match state.selected() {
        _ if len == 0 => state.select(None),
        Some(i) if i >= len => state.select(Some(len - 1)),
        None => state.select(Some(0)),
        _ => {}
    }
}

impl<'a> App<'a> {
    pub fn new(console: Console, rt: &'a Runtime) -> Self {
        let mut app = App {
            console,
            rt,
            current_tab: TAB_DASHBOARD,
            summary: DashboardSummary::default(),
            tasks: Vec::new(),
            members: Vec::new(),
            inventory: Inventory::default(),
            configs: Vec::new(),
            outbox_len: 0,
            task_list_state: ListState::default(),
            member_list_state: ListState::default(),
            category_list_state: ListState::default(),
            product_list_state: ListState::default(),
            config_list_state: ListState::default(),
            inventory_focus: InventoryFocus::Products,
            popup: Popup::None,
            notices: Vec::new(),
            busy: false,
            should_quit: false,
        };
        app.perform(Action::Refresh);
        app
    }

    fn absorb<T>(&mut self, result: ConsoleResult<Outcome<T>>) -> Option<T> {
        match result {
            Ok(outcome) => {
                self.notices.extend(outcome.notices);
                Some(outcome.value)
            }
            Err(e) => {
                self.notices.push(Notice::error(e.to_string()));
                None
            }
        }
    }

    pub fn refresh_data(&mut self) {
        let tasks = self.rt.block_on(self.console.load_tasks());
        if let Some(tasks) = self.absorb(tasks) {
            self.tasks = tasks;
        }
        let members = self.rt.block_on(self.console.load_members()).map(Outcome::new);
        if let Some(members) = self.absorb(members) {
            self.members = members;
        }
        let inventory = self.rt.block_on(self.console.load_inventory());
        if let Some(inventory) = self.absorb(inventory) {
            self.inventory = inventory;
        }
        self.summary = rules::summarize(&self.tasks, &self.inventory.products, &Local::now());

        let local = &self.console.context().local;
        self.outbox_len = outbox::pending(local).map(|e| e.len()).unwrap_or(0);
        self.configs = KNOWN_KEYS
            .iter()
            .map(|key| (key.to_string(), local.get_config(key).ok().flatten()))
            .collect();

        clamp(&mut self.task_list_state, self.tasks.len());
        clamp(&mut self.member_list_state, self.members.len());
        clamp(&mut self.category_list_state, self.inventory.categories.len() + 1);
        let visible = self.visible_products().len();
        clamp(&mut self.product_list_state, visible);
        clamp(&mut self.config_list_state, self.configs.len());
    }

    fn perform(&mut self, action: Action) {
        let rt = self.rt;
        let console = &self.console;
        let done: Option<String> = match action {
            Action::Refresh => None,
            Action::CreateTask {
                title,
                assignee,
                due_date,
                description,
            } => {
                let r = rt.block_on(console.create_task(&title, &assignee, due_date, description));
                self.absorb(r).map(|t| format!("Task '{}' created", t.title))
            }
            Action::CompleteTask(id) => {
                let r = rt.block_on(console.complete_task(&id));
                self.absorb(r).map(|_| "Task completed".to_string())
            }
            Action::EditTask { id, patch } => {
                let r = rt.block_on(console.edit_task(&id, patch));
                self.absorb(r).map(|_| "Task updated".to_string())
            }
            Action::DeleteTask(id) => {
                let r = rt.block_on(console.delete_task(&id));
                self.absorb(r).map(|_| "Task deleted".to_string())
            }
            Action::AddMember(name) => {
                let r = rt.block_on(console.add_member(&name));
                self.absorb(r).map(|m| format!("Member '{}' added", m.name))
            }
            Action::RenameMember { id, name } => {
                let r = rt.block_on(console.rename_member(&id, &name));
                self.absorb(r).map(|_| "Member renamed".to_string())
            }
            Action::DeleteMember(id) => {
                let r = rt.block_on(console.delete_member(&id));
                self.absorb(r).map(|_| "Member removed".to_string())
            }
            Action::AddProduct {
                name,
                stock,
                threshold,
                category_id,
            } => {
                let r = rt.block_on(console.add_product(
                    &name,
                    stock,
                    threshold,
                    category_id.as_deref(),
                ));
                self.absorb(r).map(|p| format!("Product '{}' added", p.name))
            }
            Action::Outbound { id, quantity } => {
                let r = rt.block_on(console.outbound(&id, quantity));
                self.absorb(r)
                    .map(|c| format!("Stock {} -> {}", c.before, c.after))
            }
            Action::Inbound { id, quantity } => {
                let r = rt.block_on(console.inbound(&id, quantity));
                self.absorb(r)
                    .map(|c| format!("Stock {} -> {}", c.before, c.after))
            }
            Action::MoveProduct { id, category_id } => {
                let r = rt.block_on(console.move_product(&id, &category_id));
                self.absorb(r).map(|c| format!("Moved to '{}'", c.name))
            }
            Action::EditProduct { id, patch } => {
                let r = rt.block_on(console.edit_product(&id, patch));
                self.absorb(r).map(|_| "Product updated".to_string())
            }
            Action::DeleteProduct(id) => {
                let r = rt.block_on(console.delete_product(&id));
                self.absorb(r).map(|_| "Product deleted".to_string())
            }
            Action::AddCategory(name) => {
                let r = rt.block_on(console.add_category(&name));
                self.absorb(r).map(|c| format!("Category '{}' added", c.name))
            }
            Action::RenameCategory { id, name } => {
                let r = rt.block_on(console.rename_category(&id, &name));
                self.absorb(r).map(|_| "Category renamed".to_string())
            }
            Action::DeleteCategory(id) => {
                let r = rt.block_on(console.delete_category(&id));
                self.absorb(r)
                    .map(|_| "Category deleted; products moved to the default".to_string())
            }
            Action::SetConfig { key, value } => {
                match self.console.context().local.set_config(&key, &value) {
                    Ok(()) => Some(format!("{} saved; takes effect on next start", key)),
                    Err(e) => {
                        self.notices.push(Notice::error(e.to_string()));
                        None
                    }
                }
            }
        };
        if let Some(message) = done {
            self.notices.insert(0, Notice::info(message));
        }
        self.refresh_data();
    }

    pub fn next_tab(&mut self) {
        self.current_tab = (self.current_tab + 1) % TAB_TITLES.len();
    }

    pub fn previous_tab(&mut self) {
        self.current_tab = if self.current_tab == 0 {
            TAB_TITLES.len() - 1
        } else {
            self.current_tab - 1
        };
    }

    pub fn next_item(&mut self) {
        self.move_selection(true);
    }

    pub fn previous_item(&mut self) {
        self.move_selection(false);
    }

    fn move_selection(&mut self, forward: bool) {
        match self.current_tab {
            TAB_TASKS => step(&mut self.task_list_state, self.tasks.len(), forward),
            TAB_MEMBERS => step(&mut self.member_list_state, self.members.len(), forward),
            TAB_INVENTORY => match self.inventory_focus {
                InventoryFocus::Categories => {
                    let len = self.inventory.categories.len() + 1;
                    step(&mut self.category_list_state, len, forward);
                    let visible = self.visible_products().len();
                    self.product_list_state.select(None);
                    clamp(&mut self.product_list_state, visible);
                }
                InventoryFocus::Products => {
                    let len = self.visible_products().len();
                    step(&mut self.product_list_state, len, forward);
                }
            },
            TAB_CONFIG => step(&mut self.config_list_state, self.configs.len(), forward),
            _ => {}
        }
    }

    /// `None` is the "All products" entry at the top of the category list.
    fn selected_category(&self) -> Option<&Category> {
        match self.category_list_state.selected() {
            Some(0) | None => None,
            Some(i) => self.inventory.categories.get(i - 1),
        }
    }

    fn visible_products(&self) -> Vec<&Product> {
        match self.selected_category() {
            None => self.inventory.products.iter().collect(),
            Some(category) => self
                .inventory
                .products
                .iter()
                .filter(|p| p.category_id == category.id)
                .collect(),
        }
    }

    fn selected_task(&self) -> Option<&Task> {
        self.task_list_state.selected().and_then(|i| self.tasks.get(i))
    }

    fn selected_member(&self) -> Option<&Member> {
        self.member_list_state
            .selected()
            .and_then(|i| self.members.get(i))
    }

    fn selected_product(&self) -> Option<&Product> {
        let visible = self.visible_products();
        self.product_list_state
            .selected()
            .and_then(|i| visible.get(i).copied())
    }

    fn open_form(&mut self, form: Form) {
        self.popup = Popup::Form(form);
    }

    fn confirm(&mut self, prompt: String, action: Action) {
        self.popup = Popup::Confirm { prompt, action };
    }

    pub fn close_popup(&mut self) {
        self.popup = Popup::None;
    }

    pub fn has_popup(&self) -> bool {
        !matches!(self.popup, Popup::None)
    }

    /// Keys while a popup is open. Returns the action to run, if any.
    fn handle_popup_key(&mut self, key: KeyCode) -> Option<Action> {
        if key == KeyCode::Esc {
            self.close_popup();
            return None;
        }
        match &mut self.popup {
            Popup::None => None,
            Popup::Form(form) => match key {
                KeyCode::Enter => match form.to_action() {
                    Ok(action) => {
                        self.popup = Popup::None;
                        Some(action)
                    }
                    Err(message) => {
                        self.notices = vec![Notice::error(message)];
                        None
                    }
                },
                KeyCode::Tab | KeyCode::Down => {
                    form.next_field();
                    None
                }
                KeyCode::BackTab | KeyCode::Up => {
                    form.previous_field();
                    None
                }
                KeyCode::Backspace => {
                    if let Some(field) = form.focused_mut() {
                        field.value.pop();
                    }
                    None
                }
                KeyCode::Char(c) => {
                    if let Some(field) = form.focused_mut() {
                        field.value.push(c);
                    }
                    None
                }
                _ => None,
            },
            Popup::ChooseCategory { product_id, state } => match key {
                KeyCode::Down => {
                    step(state, self.inventory.categories.len(), true);
                    None
                }
                KeyCode::Up => {
                    step(state, self.inventory.categories.len(), false);
                    None
                }
                KeyCode::Enter => {
                    let choice = state
                        .selected()
                        .and_then(|i| self.inventory.categories.get(i))
                        .map(|c| c.id.clone());
                    let id = product_id.clone();
                    self.popup = Popup::None;
                    choice.map(|category_id| Action::MoveProduct { id, category_id })
                }
                _ => None,
            },
            Popup::Confirm { action, .. } => {
                let action = action.clone();
                self.popup = Popup::None;
                match key {
                    KeyCode::Char('y') | KeyCode::Char('Y') => Some(action),
                    _ => None,
                }
            }
        }
    }

    /// Keys on the plain tab view. Returns the action to run, if any.
    fn handle_key(&mut self, key: KeyCode) -> Option<Action> {
        match key {
            KeyCode::Char('q') => {
                self.should_quit = true;
                None
            }
            KeyCode::Tab => {
                self.next_tab();
                None
            }
            KeyCode::BackTab => {
                self.previous_tab();
                None
            }
            KeyCode::Down => {
                self.next_item();
                None
            }
            KeyCode::Up => {
                self.previous_item();
                None
            }
            KeyCode::Char('r') => Some(Action::Refresh),
            _ => match self.current_tab {
                TAB_TASKS => self.handle_task_key(key),
                TAB_MEMBERS => self.handle_member_key(key),
                TAB_INVENTORY => self.handle_inventory_key(key),
                TAB_CONFIG => self.handle_config_key(key),
                _ => None,
            },
        }
    }

    fn handle_task_key(&mut self, key: KeyCode) -> Option<Action> {
        match key {
            KeyCode::Char('a') => {
                let tomorrow = (Local::now().date_naive() + chrono::Duration::days(1)).to_string();
                let assignee = self
                    .selected_member()
                    .map(|m| m.name.clone())
                    .unwrap_or_default();
                self.open_form(Form::new(
                    "New Task",
                    FormKind::NewTask,
                    &[
                        ("Title", ""),
                        ("Assignee", assignee.as_str()),
                        ("Due (YYYY-MM-DD)", tomorrow.as_str()),
                        ("Description", ""),
                    ],
                ));
                None
            }
            KeyCode::Enter | KeyCode::Char('c') => {
                let task = self.selected_task()?;
                if task.status != TaskStatus::Pending {
                    self.notices = vec![Notice::warning(format!(
                        "Only pending tasks can be completed ('{}' is {})",
                        task.title, task.status
                    ))];
                    return None;
                }
                Some(Action::CompleteTask(task.id.clone()))
            }
            KeyCode::Char('e') => {
                let task = self.selected_task()?;
                let due = task.due_date.to_string();
                let form = Form::new(
                    "Edit Task",
                    FormKind::EditTask(task.id.clone()),
                    &[
                        ("Title", task.title.as_str()),
                        ("Assignee", task.assignee.as_str()),
                        ("Due (YYYY-MM-DD)", due.as_str()),
                        ("Description", task.description.as_deref().unwrap_or("")),
                    ],
                );
                self.open_form(form);
                None
            }
            KeyCode::Char('d') => {
                let task = self.selected_task()?;
                let prompt = format!("Delete task '{}'?", task.title);
                let action = Action::DeleteTask(task.id.clone());
                self.confirm(prompt, action);
                None
            }
            _ => None,
        }
    }

    fn handle_member_key(&mut self, key: KeyCode) -> Option<Action> {
        match key {
            KeyCode::Char('a') => {
                self.open_form(Form::new("New Member", FormKind::NewMember, &[("Name", "")]));
                None
            }
            KeyCode::Char('e') | KeyCode::Enter => {
                let member = self.selected_member()?;
                let form = Form::new(
                    "Rename Member",
                    FormKind::RenameMember(member.id.clone()),
                    &[("Name", member.name.as_str())],
                );
                self.open_form(form);
                None
            }
            KeyCode::Char('d') => {
                let member = self.selected_member()?;
                let prompt = format!("Remove member '{}'?", member.name);
                let action = Action::DeleteMember(member.id.clone());
                self.confirm(prompt, action);
                None
            }
            _ => None,
        }
    }

    fn handle_inventory_key(&mut self, key: KeyCode) -> Option<Action> {
        match key {
            KeyCode::Left => {
                self.inventory_focus = InventoryFocus::Categories;
                return None;
            }
            KeyCode::Right => {
                self.inventory_focus = InventoryFocus::Products;
                return None;
            }
            _ => {}
        }

        match self.inventory_focus {
            InventoryFocus::Categories => match key {
                KeyCode::Char('a') => {
                    self.open_form(Form::new(
                        "New Category",
                        FormKind::NewCategory,
                        &[("Name", "")],
                    ));
                    None
                }
                KeyCode::Char('e') => {
                    let category = self.selected_category()?;
                    let form = Form::new(
                        "Rename Category",
                        FormKind::RenameCategory(category.id.clone()),
                        &[("Name", category.name.as_str())],
                    );
                    self.open_form(form);
                    None
                }
                KeyCode::Char('d') => {
                    let category = self.selected_category()?;
                    let prompt = format!(
                        "Delete category '{}'? Its products move to the default category.",
                        category.name
                    );
                    let action = Action::DeleteCategory(category.id.clone());
                    self.confirm(prompt, action);
                    None
                }
                _ => None,
            },
            InventoryFocus::Products => match key {
                KeyCode::Char('a') => {
                    let category_id = self.selected_category().map(|c| c.id.clone());
                    self.open_form(Form::new(
                        "New Product",
                        FormKind::NewProduct(category_id),
                        &[("Name", ""), ("Stock", "0"), ("Threshold", "10")],
                    ));
                    None
                }
                KeyCode::Char('o') => {
                    let product = self.selected_product()?;
                    let form = Form::new(
                        format!("Outbound: {} ({} on hand)", product.name, product.stock),
                        FormKind::Outbound(product.id.clone()),
                        &[("Quantity", "1")],
                    );
                    self.open_form(form);
                    None
                }
                KeyCode::Char('i') => {
                    let product = self.selected_product()?;
                    let form = Form::new(
                        format!("Inbound: {} ({} on hand)", product.name, product.stock),
                        FormKind::Inbound(product.id.clone()),
                        &[("Quantity", "1")],
                    );
                    self.open_form(form);
                    None
                }
                KeyCode::Char('e') | KeyCode::Enter => {
                    let product = self.selected_product()?;
                    let (stock, threshold) = (product.stock.to_string(), product.threshold.to_string());
                    let form = Form::new(
                        "Edit Product",
                        FormKind::EditProduct(product.id.clone()),
                        &[
                            ("Name", product.name.as_str()),
                            ("Stock", stock.as_str()),
                            ("Threshold", threshold.as_str()),
                        ],
                    );
                    self.open_form(form);
                    None
                }
                KeyCode::Char('m') => {
                    let product_id = self.selected_product()?.id.clone();
                    let mut state = ListState::default();
                    state.select(Some(0));
                    self.popup = Popup::ChooseCategory { product_id, state };
                    None
                }
                KeyCode::Char('d') => {
                    let product = self.selected_product()?;
                    let prompt = format!("Delete product '{}'?", product.name);
                    let action = Action::DeleteProduct(product.id.clone());
                    self.confirm(prompt, action);
                    None
                }
                _ => None,
            },
        }
    }

    fn handle_config_key(&mut self, key: KeyCode) -> Option<Action> {
        match key {
            KeyCode::Enter | KeyCode::Char('e') => {
                let i = self.config_list_state.selected()?;
                let (key, value) = self.configs.get(i)?;
                let form = Form::new(
                    format!("Edit {}", key),
                    FormKind::ConfigEdit(key.clone()),
                    &[("Value", value.as_deref().unwrap_or(""))],
                );
                self.open_form(form);
                None
            }
            _ => None,
        }
    }
}

pub fn run_tui(console: Console, rt: &Runtime) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(console, rt);
    let res = run_app(&mut terminal, &mut app);

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("{err:?}");
    }

    Ok(())
}

fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
) -> io::Result<()> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        if let Event::Key(key) = event::read()? {
            if key.kind == KeyEventKind::Press {
                let action = if app.has_popup() {
                    app.handle_popup_key(key.code)
                } else {
                    app.handle_key(key.code)
                };

                if let Some(action) = action {
                    app.notices.clear();
                    app.busy = true;
                    terminal.draw(|f| ui(f, app))?;
                    app.perform(action);
                    app.busy = false;
                }
            }
        }

        if app.should_quit {
            break;
        }
    }
    Ok(())
}

fn ui(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(3),
        ])
        .split(f.area());

    let titles: Vec<Line> = TAB_TITLES.iter().cloned().map(Line::from).collect();
    let title = format!("opsdesk [{}]", app.console.context().kind());
    let tabs = Tabs::new(titles)
        .block(Block::default().borders(Borders::ALL).title(title))
        .select(app.current_tab)
        .style(Style::default().fg(Color::Cyan))
        .highlight_style(
            Style::default()
                .add_modifier(Modifier::BOLD)
                .bg(Color::Black),
        );

    f.render_widget(tabs, chunks[0]);

    match app.current_tab {
        TAB_DASHBOARD => render_dashboard(f, app, chunks[1]),
        TAB_TASKS => render_tasks(f, app, chunks[1]),
        TAB_MEMBERS => render_members(f, app, chunks[1]),
        TAB_INVENTORY => render_inventory(f, app, chunks[1]),
        TAB_CONFIG => render_configs(f, app, chunks[1]),
        _ => {}
    }

    render_status(f, app, chunks[2]);
    render_popup(f, app);
}

// Helper function to create centered rectangles for popups
fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn highlighted(list: List) -> List {
    list.highlight_style(
        Style::default()
            .bg(Color::LightGreen)
            .add_modifier(Modifier::BOLD),
    )
    .highlight_symbol(">> ")
}

fn status_color(status: TaskStatus) -> Color {
    match status {
        TaskStatus::Completed => Color::Green,
        TaskStatus::Pending => Color::Yellow,
        TaskStatus::Overdue => Color::Red,
    }
}

fn level_color(level: Level) -> Color {
    match level {
        Level::Info => Color::Green,
        Level::Warning => Color::Yellow,
        Level::Error => Color::Red,
    }
}

fn render_status(f: &mut Frame, app: &App, area: Rect) {
    let line = if app.busy {
        Line::from(Span::styled(
            "Working...",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
    } else if app.notices.is_empty() {
        Line::from("Tab: switch view | ↑/↓: navigate | r: refresh | q: quit")
    } else {
        let spans: Vec<Span> = app
            .notices
            .iter()
            .map(|n| Span::styled(format!("{}  ", n.message), Style::default().fg(level_color(n.level))))
            .collect();
        Line::from(spans)
    };
    let paragraph = Paragraph::new(line)
        .block(Block::default().borders(Borders::ALL))
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn render_dashboard(f: &mut Frame, app: &mut App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let summary = &app.summary;
    let ctx = app.console.context();
    let mut lines = vec![
        Line::from(format!("Total tasks:        {}", summary.total_tasks)),
        Line::from(Span::styled(
            format!("Completed:          {}", summary.completed_tasks),
            Style::default().fg(Color::Green),
        )),
        Line::from(Span::styled(
            format!("Pending:            {}", summary.pending_tasks),
            Style::default().fg(Color::Yellow),
        )),
        Line::from(Span::styled(
            format!("Overdue:            {}", summary.overdue_tasks),
            Style::default().fg(Color::Red),
        )),
        Line::from(format!("Weekly completion:  {}%", summary.weekly_completion_rate)),
        Line::from(format!("Low-stock products: {}", summary.low_stock.len())),
        Line::from(""),
        Line::from(format!("Backend: {} ({})", ctx.kind(), ctx.reason)),
    ];
    if ctx.is_remote() {
        lines.push(Line::from(format!("Write policy: {}", ctx.write_policy)));
    }
    if app.outbox_len > 0 {
        lines.push(Line::from(Span::styled(
            format!("Outbox: {} queued write(s), run `opsdesk outbox-replay`", app.outbox_len),
            Style::default().fg(Color::Yellow),
        )));
    }

    let overview = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Overview"))
        .wrap(Wrap { trim: false });
    f.render_widget(overview, chunks[0]);

    let items: Vec<ListItem> = summary
        .low_stock
        .iter()
        .map(|p| {
            ListItem::new(Line::from(vec![
                Span::styled(format!("{} ", p.name), Style::default().fg(Color::White)),
                Span::styled(
                    format!("{} / {}", p.stock, p.threshold),
                    Style::default().fg(Color::Red),
                ),
            ]))
        })
        .collect();
    let low_stock = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Low Stock"),
    );
    f.render_widget(low_stock, chunks[1]);
}

fn render_tasks(f: &mut Frame, app: &mut App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let tasks: Vec<ListItem> = app
        .tasks
        .iter()
        .map(|task| {
            ListItem::new(vec![Line::from(vec![
                Span::styled(format!("{} ", task.title), Style::default().fg(Color::White)),
                Span::styled(
                    format!("({}, {}) ", task.assignee, task.due_date),
                    Style::default().fg(Color::Cyan),
                ),
                Span::styled(
                    format!("[{}]", task.status),
                    Style::default().fg(status_color(task.status)),
                ),
            ])])
        })
        .collect();

    let tasks_list =
        highlighted(List::new(tasks).block(Block::default().borders(Borders::ALL).title("Tasks")));
    f.render_stateful_widget(tasks_list, chunks[0], &mut app.task_list_state);

    let controls = "Controls:\n• a: New task\n• Enter/c: Complete\n• e: Edit\n• d: Delete\n• r: Refresh\n• q: Quit";
    let info_text = match app.selected_task() {
        Some(task) => format!(
            "Task: {}\nAssignee: {}\nDue: {}\nStatus: {}\nCreated: {}\n{}\n\n{}",
            task.title,
            task.assignee,
            task.due_date,
            task.status,
            task.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            task.description.as_deref().unwrap_or(""),
            controls
        ),
        None => format!("No task selected\n\n{}", controls),
    };

    let info_paragraph = Paragraph::new(info_text)
        .block(Block::default().borders(Borders::ALL).title("Task Info"))
        .wrap(Wrap { trim: false })
        .style(Style::default().fg(Color::White));
    f.render_widget(info_paragraph, chunks[1]);
}

fn render_members(f: &mut Frame, app: &mut App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let members: Vec<ListItem> = app
        .members
        .iter()
        .map(|m| ListItem::new(Line::from(m.name.clone())))
        .collect();
    let members_list = highlighted(
        List::new(members).block(Block::default().borders(Borders::ALL).title("Members")),
    );
    f.render_stateful_widget(members_list, chunks[0], &mut app.member_list_state);

    let controls = "Controls:\n• a: Add member\n• Enter/e: Rename\n• d: Remove\n• r: Refresh\n• q: Quit";
    let info_text = match app.selected_member() {
        Some(member) => {
            let open = app
                .tasks
                .iter()
                .filter(|t| t.assignee == member.name && t.status != TaskStatus::Completed)
                .count();
            format!(
                "Member: {}\nOpen tasks: {}\n\n{}",
                member.name, open, controls
            )
        }
        None => format!("No member selected\n\n{}", controls),
    };
    let info_paragraph = Paragraph::new(info_text)
        .block(Block::default().borders(Borders::ALL).title("Member Info"))
        .style(Style::default().fg(Color::White));
    f.render_widget(info_paragraph, chunks[1]);
}

fn render_inventory(f: &mut Frame, app: &mut App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(30), Constraint::Percentage(70)])
        .split(area);

    let focused = Style::default().fg(Color::Cyan);
    let border = |focus: InventoryFocus| {
        if app.inventory_focus == focus {
            focused
        } else {
            Style::default()
        }
    };

    let mut categories = vec![ListItem::new(Line::from(format!(
        "All products ({})",
        app.inventory.products.len()
    )))];
    categories.extend(app.inventory.categories.iter().map(|c| {
        let count = app
            .inventory
            .products
            .iter()
            .filter(|p| p.category_id == c.id)
            .count();
        let marker = if c.is_default() { " *" } else { "" };
        ListItem::new(Line::from(format!("{}{} ({})", c.name, marker, count)))
    }));
    let categories_list = highlighted(
        List::new(categories).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(border(InventoryFocus::Categories))
                .title("Categories [a/e/d]"),
        ),
    );

    let products: Vec<ListItem> = app
        .visible_products()
        .into_iter()
        .map(|p| {
            let low = rules::is_low_stock(p);
            let category = app.inventory.category_name(&p.category_id).unwrap_or("?");
            ListItem::new(Line::from(vec![
                Span::styled(format!("{} ", p.name), Style::default().fg(Color::White)),
                Span::styled(
                    format!("{} / {} ", p.stock, p.threshold),
                    Style::default().fg(if low { Color::Red } else { Color::Green }),
                ),
                Span::styled(format!("[{}]", category), Style::default().fg(Color::Cyan)),
            ]))
        })
        .collect();
    let products_list = highlighted(
        List::new(products).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(border(InventoryFocus::Products))
                .title("Products (stock / threshold) [a: add, e: edit, o: out, i: in, m: move, d: delete]"),
        ),
    );

    f.render_stateful_widget(categories_list, chunks[0], &mut app.category_list_state);
    f.render_stateful_widget(products_list, chunks[1], &mut app.product_list_state);
}

fn render_configs(f: &mut Frame, app: &mut App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let configs: Vec<ListItem> = app
        .configs
        .iter()
        .map(|(key, value)| {
            let shown = match value {
                Some(v) if key == config::KEY_SUPABASE_KEY => config::mask(v),
                Some(v) => v.clone(),
                None => "(unset)".to_string(),
            };
            ListItem::new(vec![Line::from(vec![
                Span::styled(format!("{} ", key), Style::default().fg(Color::White)),
                Span::styled(format!("={}", shown), Style::default().fg(Color::Cyan)),
            ])])
        })
        .collect();

    let configs_list = highlighted(
        List::new(configs).block(Block::default().borders(Borders::ALL).title("Configs")),
    );
    f.render_stateful_widget(configs_list, chunks[0], &mut app.config_list_state);

    let info_text = "Stored in the local database.\nEnvironment variables take precedence.\nChanges apply on the next start.\n\nControls:\n• Enter: Edit config value\n• r: Refresh\n• q: Quit";
    let info_paragraph = Paragraph::new(info_text)
        .block(Block::default().borders(Borders::ALL).title("Config Info"))
        .style(Style::default().fg(Color::White));
    f.render_widget(info_paragraph, chunks[1]);
}

fn render_popup(f: &mut Frame, app: &mut App) {
    let popup_style = Style::default().bg(Color::DarkGray);
    match &mut app.popup {
        Popup::None => {}
        Popup::Form(form) => {
            let popup_area = centered_rect(60, 40, f.area());
            let mut lines = Vec::new();
            for (i, field) in form.fields.iter().enumerate() {
                let style = if i == form.focus {
                    Style::default().fg(Color::Black).bg(Color::Cyan)
                } else {
                    Style::default().fg(Color::White)
                };
                lines.push(Line::from(vec![
                    Span::styled(format!("{}: ", field.label), Style::default().fg(Color::White)),
                    Span::styled(format!("{}_", field.value), style),
                ]));
            }
            lines.push(Line::from(""));
            lines.push(Line::from("Tab/↑/↓: switch field | Enter: save | Esc: cancel"));

            let block = Block::default()
                .title(form.title.clone())
                .borders(Borders::ALL)
                .style(popup_style);
            f.render_widget(Clear, popup_area);
            f.render_widget(Paragraph::new(lines).block(block), popup_area);
        }
        Popup::ChooseCategory { state, .. } => {
            let popup_area = centered_rect(40, 40, f.area());
            let items: Vec<ListItem> = app
                .inventory
                .categories
                .iter()
                .map(|c| ListItem::new(Line::from(c.name.clone())))
                .collect();
            let list = highlighted(
                List::new(items).block(
                    Block::default()
                        .title("Move to category (Enter: move, Esc: cancel)")
                        .borders(Borders::ALL)
                        .style(popup_style),
                ),
            );
            f.render_widget(Clear, popup_area);
            f.render_stateful_widget(list, popup_area, state);
        }
        Popup::Confirm { prompt, .. } => {
            let popup_area = centered_rect(50, 20, f.area());
            let block = Block::default()
                .title("Confirm")
                .borders(Borders::ALL)
                .style(popup_style);
            let content = Paragraph::new(format!("{}\n\ny: yes, any other key: cancel", prompt))
                .block(block)
                .alignment(Alignment::Center)
                .wrap(Wrap { trim: false })
                .style(Style::default().fg(Color::White));
            f.render_widget(Clear, popup_area);
            f.render_widget(content, popup_area);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_wraps_both_ways() {
        let mut state = ListState::default();
        step(&mut state, 3, true);
        assert_eq!(state.selected(), Some(0));
        step(&mut state, 3, false);
        assert_eq!(state.selected(), Some(2));
        step(&mut state, 3, true);
        assert_eq!(state.selected(), Some(0));
        step(&mut state, 0, true);
        assert_eq!(state.selected(), None);
    }

    #[test]
    fn clamp_keeps_selection_in_range() {
        let mut state = ListState::default();
        state.select(Some(5));
        clamp(&mut state, 2);
        assert_eq!(state.selected(), Some(1));
        clamp(&mut state, 0);
        assert_eq!(state.selected(), None);
    }

    #[test]
    fn product_form_requires_numbers() {
        let mut form = Form::new(
            "New Product",
            FormKind::NewProduct(None),
            &[("Name", "Widget"), ("Stock", "ten"), ("Threshold", "5")],
        );
        assert!(form.to_action().unwrap_err().contains("Stock"));

        form.fields[1].value = "10".to_string();
        match form.to_action().unwrap() {
            Action::AddProduct { stock, threshold, .. } => {
                assert_eq!((stock, threshold), (10, 5));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn task_form_parses_due_date() {
        let form = Form::new(
            "New Task",
            FormKind::NewTask,
            &[
                ("Title", "Count stock"),
                ("Assignee", "Ana"),
                ("Due (YYYY-MM-DD)", "2024-06-01"),
                ("Description", ""),
            ],
        );
        match form.to_action().unwrap() {
            Action::CreateTask {
                due_date,
                description,
                ..
            } => {
                assert_eq!(due_date, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
                assert_eq!(description, None);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn edit_product_form_builds_full_patch() {
        let form = Form::new(
            "Edit Product",
            FormKind::EditProduct("7".to_string()),
            &[("Name", " Widget "), ("Stock", "12"), ("Threshold", "4")],
        );
        match form.to_action().unwrap() {
            Action::EditProduct { id, patch } => {
                assert_eq!(id, "7");
                assert_eq!(patch.name.as_deref(), Some("Widget"));
                assert_eq!((patch.stock, patch.threshold), (Some(12), Some(4)));
                assert_eq!(patch.category_id, None);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn edit_task_form_sends_empty_description_to_clear_it() {
        let form = Form::new(
            "Edit Task",
            FormKind::EditTask("3".to_string()),
            &[
                ("Title", "Count stock"),
                ("Assignee", "Ana"),
                ("Due (YYYY-MM-DD)", "2024-06-01"),
                ("Description", ""),
            ],
        );
        match form.to_action().unwrap() {
            Action::EditTask { patch, .. } => {
                assert_eq!(patch.description.as_deref(), Some(""));
                assert_eq!(patch.status, None);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn config_form_validates_value() {
        let form = Form::new(
            "Edit write_policy",
            FormKind::ConfigEdit(config::KEY_WRITE_POLICY.to_string()),
            &[("Value", "sometimes")],
        );
        assert!(form.to_action().is_err());
    }
}
